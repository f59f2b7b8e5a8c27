//! Backup storage and incremental-tracking core for PostgreSQL.
//!
//! The pieces, bottom up: [`brt`] tracks which blocks changed across a
//! WAL range and serializes that knowledge; [`summarizer`] distills it
//! from WAL segments via the `wal_decoder` crate; [`streamer`] moves
//! file contents through compression and encryption; [`manifest`] and
//! [`info`] are the per-backup metadata files; [`repository`] is the
//! on-disk layout plus catalogs and locks; [`workers`] is the fan-out
//! pool; and [`workflow`] wires it all into backup, restore, delete,
//! retention, verify and combine pipelines.

pub mod brt;
pub mod config;
pub mod error;
pub mod info;
pub mod manifest;
pub mod repository;
pub mod source;
pub mod sparse;
pub mod streamer;
pub mod summarizer;
pub mod workers;
pub mod workflow;
