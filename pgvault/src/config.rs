//! Configuration model and validation.
//!
//! The configuration is a TOML file: a global section plus one
//! `[servers.<name>]` table per PostgreSQL server. Time values accept
//! the `s|m|h|d|w` suffixes; validation rejects anything
//! [`utils::duration::parse_duration`] rejects.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Compression codec applied by the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Zstd,
    Lz4,
    Bzip2,
}

impl CompressionCodec {
    /// The file extension appended to compressed destinations.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressionCodec::None => None,
            CompressionCodec::Gzip => Some("gz"),
            CompressionCodec::Zstd => Some("zstd"),
            CompressionCodec::Lz4 => Some("lz4"),
            CompressionCodec::Bzip2 => Some("bz2"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Zstd => "zstd",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Bzip2 => "bzip2",
        }
    }
}

/// Where compression runs. `server` offloads to the PostgreSQL side of
/// the base backup stream and is accepted but treated as client-side
/// whenever the stream is produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionSite {
    #[default]
    Default,
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressionConfig {
    pub codec: CompressionCodec,
    pub site: CompressionSite,
}

impl FromStr for CompressionConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (site, codec) = match s.strip_prefix("client_") {
            Some(rest) => (CompressionSite::Client, rest),
            None => match s.strip_prefix("server_") {
                Some(rest) => (CompressionSite::Server, rest),
                None => (CompressionSite::Default, s),
            },
        };
        let codec = match codec {
            "none" => CompressionCodec::None,
            "gzip" => CompressionCodec::Gzip,
            "zstd" => CompressionCodec::Zstd,
            "lz4" => CompressionCodec::Lz4,
            "bzip2" if site != CompressionSite::Server => CompressionCodec::Bzip2,
            _ => return Err(format!("unknown compression {s:?}")),
        };
        Ok(CompressionConfig { codec, site })
    }
}

impl<'de> Deserialize<'de> for CompressionConfig {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// AES key sizes supported by the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesBits {
    Aes128,
    Aes192,
    Aes256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesMode {
    Cbc,
    Ctr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionConfig {
    #[default]
    None,
    Aes {
        bits: AesBits,
        mode: AesMode,
    },
}

impl EncryptionConfig {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionConfig::None => "none",
            EncryptionConfig::Aes { bits, mode } => match (bits, mode) {
                (AesBits::Aes128, AesMode::Cbc) => "aes-128-cbc",
                (AesBits::Aes192, AesMode::Cbc) => "aes-192-cbc",
                (AesBits::Aes256, AesMode::Cbc) => "aes-256-cbc",
                (AesBits::Aes128, AesMode::Ctr) => "aes-128-ctr",
                (AesBits::Aes192, AesMode::Ctr) => "aes-192-ctr",
                (AesBits::Aes256, AesMode::Ctr) => "aes-256-ctr",
            },
        }
    }
}

impl FromStr for EncryptionConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "none" {
            return Ok(EncryptionConfig::None);
        }
        let rest = s
            .strip_prefix("aes-")
            .ok_or_else(|| format!("unknown encryption {s:?}"))?;
        let (bits, mode) = rest
            .split_once('-')
            .ok_or_else(|| format!("unknown encryption {s:?}"))?;
        let bits = match bits {
            "128" => AesBits::Aes128,
            "192" => AesBits::Aes192,
            "256" => AesBits::Aes256,
            _ => return Err(format!("unknown AES key size {bits:?}")),
        };
        let mode = match mode {
            "cbc" => AesMode::Cbc,
            "ctr" => AesMode::Ctr,
            _ => return Err(format!("unknown AES mode {mode:?}")),
        };
        Ok(EncryptionConfig::Aes { bits, mode })
    }
}

impl<'de> Deserialize<'de> for EncryptionConfig {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash algorithm for the local manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    Sha256,
    #[default]
    Sha512,
    Crc32c,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha-256",
            HashAlgorithm::Sha512 => "sha-512",
            HashAlgorithm::Crc32c => "crc32c",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sha-256" | "sha256" => Ok(HashAlgorithm::Sha256),
            "sha-512" | "sha512" => Ok(HashAlgorithm::Sha512),
            "crc32c" => Ok(HashAlgorithm::Crc32c),
            _ => Err(format!("unknown hash algorithm {s:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Retention thresholds: `days weeks months years`. A non-positive
/// value disables that tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub days: i32,
    pub weeks: i32,
    pub months: i32,
    pub years: i32,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            days: 7,
            weeks: 0,
            months: 0,
            years: 0,
        }
    }
}

impl Retention {
    pub fn tier_enabled(n: i32) -> bool {
        n > 0
    }
}

impl FromStr for Retention {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 4 {
            return Err(format!(
                "retention must be four values (days weeks months years), got {s:?}"
            ));
        }
        let mut nums = [0i32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("invalid retention value {part:?}"))?;
        }
        Ok(Retention {
            days: nums[0],
            weeks: nums[1],
            months: nums[2],
            years: nums[3],
        })
    }
}

impl<'de> Deserialize<'de> for Retention {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let s: Option<String> = Option::deserialize(d)?;
    match s {
        None => Ok(None),
        Some(s) => utils::duration::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Per-server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Local data directory, for probing the control file and for the
    /// local copy source.
    pub data_dir: Option<Utf8PathBuf>,
    pub backup_slot: Option<String>,
    pub wal_slot: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub follow: Option<String>,
    pub wal_shipping: Option<Utf8PathBuf>,
    pub hot_standby: Option<Vec<Utf8PathBuf>>,
    pub hot_standby_overrides: Option<String>,
    pub hot_standby_tablespaces: Option<Utf8PathBuf>,
    pub workers: Option<usize>,
    pub retention: Option<Retention>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub blocking_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Repository root; every server stores under `<base_dir>/<name>/`.
    pub base_dir: Utf8PathBuf,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Key material for AES modes, hex-encoded. Required when an AES
    /// encryption is configured.
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub workers: Option<usize>,
    /// Scratch directory for restore and combine.
    pub workspace: Option<Utf8PathBuf>,
    #[serde(default)]
    pub log_format: Option<String>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Utf8Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.base_dir.as_str().is_empty() {
            return Err(Error::Config("base_dir must not be empty".into()));
        }
        if let EncryptionConfig::Aes { bits, .. } = self.encryption {
            let key = self
                .encryption_key
                .as_deref()
                .ok_or_else(|| Error::Config("encryption is set but encryption_key is not".into()))?;
            let key_len = match bits {
                AesBits::Aes128 => 16,
                AesBits::Aes192 => 24,
                AesBits::Aes256 => 32,
            };
            let decoded = hex::decode(key)
                .map_err(|e| Error::Config(format!("encryption_key is not valid hex: {e}")))?;
            if decoded.len() != key_len {
                return Err(Error::Config(format!(
                    "encryption_key is {} bytes, {} expects {}",
                    decoded.len(),
                    self.encryption.as_str(),
                    key_len
                )));
            }
        }
        if let Some(0) = self.workers {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        for (name, server) in &self.servers {
            if name.is_empty() || name.contains('/') {
                return Err(Error::Config(format!("invalid server name {name:?}")));
            }
            if let Some(0) = server.workers {
                return Err(Error::Config(format!(
                    "servers.{name}.workers must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// The decoded AES key, when encryption is enabled.
    pub fn encryption_key_bytes(&self) -> Option<Vec<u8>> {
        match self.encryption {
            EncryptionConfig::None => None,
            EncryptionConfig::Aes { .. } => self
                .encryption_key
                .as_deref()
                .and_then(|k| hex::decode(k).ok()),
        }
    }

    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("server {name:?}")))
    }

    /// Worker count for a server, clamped to the CPU count.
    pub fn worker_count(&self, server: &ServerConfig) -> usize {
        let configured = server.workers.or(self.workers).unwrap_or(1);
        configured.clamp(1, num_cpus::get())
    }

    /// Retention policy for a server, falling back to the global one.
    pub fn retention_for(&self, server: &ServerConfig) -> Retention {
        server.retention.unwrap_or(self.retention)
    }

    /// Scratch directory for restore, combine and rollup.
    pub fn workspace_dir(&self) -> Utf8PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| self.base_dir.join("workspace"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
base_dir = "/var/lib/pgvault"
compression = "zstd"
encryption = "aes-128-cbc"
encryption_key = "000102030405060708090a0b0c0d0e0f"
retention = "7 4 12 5"
workers = 4

[servers.primary]
host = "db.example.com"
port = 5432
user = "backup"
data_dir = "/pgdata"
blocking_timeout = "30s"
"#;

    #[test]
    fn parses_a_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.compression.codec, CompressionCodec::Zstd);
        assert_eq!(
            config.encryption,
            EncryptionConfig::Aes { bits: AesBits::Aes128, mode: AesMode::Cbc }
        );
        assert_eq!(config.retention.days, 7);
        assert_eq!(config.retention.years, 5);
        let server = config.server("primary").unwrap();
        assert_eq!(server.blocking_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.encryption_key_bytes().unwrap().len(), 16);
        assert!(config.server("missing").is_err());
    }

    #[test]
    fn compression_site_prefixes() {
        for (s, codec, site) in [
            ("none", CompressionCodec::None, CompressionSite::Default),
            ("gzip", CompressionCodec::Gzip, CompressionSite::Default),
            ("client_lz4", CompressionCodec::Lz4, CompressionSite::Client),
            ("server_zstd", CompressionCodec::Zstd, CompressionSite::Server),
            ("client_bzip2", CompressionCodec::Bzip2, CompressionSite::Client),
        ] {
            let parsed: CompressionConfig = s.parse().unwrap();
            assert_eq!(parsed.codec, codec);
            assert_eq!(parsed.site, site);
        }
        // bzip2 cannot run on the server side
        assert!("server_bzip2".parse::<CompressionConfig>().is_err());
        assert!("snappy".parse::<CompressionConfig>().is_err());
    }

    #[test]
    fn rejects_bad_time_values() {
        for bad in ["10x", "-1s", "1h5s", "10 s", "abc", ""] {
            let text = format!(
                "base_dir = \"/tmp/x\"\n[servers.a]\nblocking_timeout = \"{bad}\"\n"
            );
            let err = Config::parse(&text).unwrap_err();
            assert_eq!(err.exit_code(), 3, "{bad:?} should be a config error");
        }
    }

    #[test]
    fn rejects_bad_keys_and_retention() {
        let missing_key = "base_dir = \"/tmp/x\"\nencryption = \"aes-256-ctr\"\n";
        assert!(Config::parse(missing_key).is_err());

        let short_key =
            "base_dir = \"/tmp/x\"\nencryption = \"aes-256-ctr\"\nencryption_key = \"00ff\"\n";
        assert!(Config::parse(short_key).is_err());

        let bad_retention = "base_dir = \"/tmp/x\"\nretention = \"7 4\"\n";
        assert!(Config::parse(bad_retention).is_err());
    }
}
