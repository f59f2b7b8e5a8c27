use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::error;

use pgvault::config::Config;
use pgvault::error::Error;
use pgvault::source::LocalClusterSource;
use pgvault::workflow::backup::run_backup;
use pgvault::workflow::combine::combine_chain;
use pgvault::workflow::delete::{run_delete, set_keep};
use pgvault::workflow::restore::run_restore;
use pgvault::workflow::retention::run_retention;
use pgvault::workflow::verify::{run_verify, VerifyScope};
use pgvault::repository::Repository;

#[derive(Parser)]
#[command(name = "pgvault", about = "PostgreSQL backup manager", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/pgvault/pgvault.toml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Take a backup of a server.
    Backup {
        server: String,
        /// Store only the blocks modified since the newest valid backup.
        #[arg(long)]
        incremental: bool,
    },
    /// Restore a backup into a target directory.
    Restore {
        server: String,
        /// Label, `newest`, `oldest`, or a `target-lsn:`/`target-time:`/
        /// `target-tli:` selector.
        identifier: String,
        target: Utf8PathBuf,
        /// Optional recovery target written into the restored cluster.
        recovery_target: Option<String>,
    },
    /// Delete a backup, rolling it into its children first.
    Delete { server: String, label: String },
    /// Protect a backup from delete and retention.
    Retain { server: String, label: String },
    /// Lift a backup's retention protection.
    Expunge { server: String, label: String },
    /// Apply the retention policy.
    Retention { server: String },
    /// Re-hash a backup's files against its manifest.
    Verify {
        server: String,
        identifier: String,
        #[arg(default_value = "failed")]
        scope: String,
    },
    /// Materialize an incremental chain as a plain data directory.
    Combine {
        server: String,
        identifier: String,
        target: Option<Utf8PathBuf>,
    },
}

fn open_source(config: &Config, server: &str) -> Result<LocalClusterSource, Error> {
    let server_config = config.server(server)?;
    let data_dir = server_config.data_dir.clone().ok_or_else(|| {
        Error::Config(format!("server {server} has no data_dir configured"))
    })?;
    Ok(LocalClusterSource::new(data_dir, None))
}

fn run(cli: Cli) -> Result<(), Error> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Backup {
            server,
            incremental,
        } => {
            let source = open_source(&config, &server)?;
            let label = run_backup(&config, &server, Box::new(source), incremental)?;
            println!("{label}");
        }
        Command::Restore {
            server,
            identifier,
            target,
            recovery_target,
        } => {
            let label = run_restore(
                &config,
                &server,
                &identifier,
                recovery_target.as_deref(),
                &target,
            )?;
            println!("{label}");
        }
        Command::Delete { server, label } => run_delete(&config, &server, &label)?,
        Command::Retain { server, label } => set_keep(&config, &server, &label, true)?,
        Command::Expunge { server, label } => set_keep(&config, &server, &label, false)?,
        Command::Retention { server } => run_retention(&config, &server)?,
        Command::Verify {
            server,
            identifier,
            scope,
        } => {
            let scope: VerifyScope = scope.parse()?;
            let report = run_verify(&config, &server, &identifier, scope)?;
            for entry in &report.entries {
                println!(
                    "{} {} {}",
                    if entry.ok { "ok " } else { "FAIL" },
                    entry.path,
                    entry.detail
                );
            }
            if !report.is_clean() {
                return Err(Error::corrupt(format!(
                    "{} files failed verification",
                    report.failed
                )));
            }
        }
        Command::Combine {
            server,
            identifier,
            target,
        } => {
            let repo = Repository::new(&config.base_dir, &server);
            let backup = repo.resolve_identifier(&identifier.parse()?)?;
            let chain = repo.backup_chain(&backup.label)?;
            let target =
                target.unwrap_or_else(|| config.workspace_dir().join(&backup.label));
            std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            let key = config.encryption_key_bytes();
            let stats = combine_chain(
                &repo,
                &chain,
                &target,
                key.as_deref(),
                &config.workspace_dir(),
            )?;
            println!(
                "{}: {} files ({} reconstructed) in {target}",
                backup.label, stats.files, stats.reconstructed
            );
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = utils::logging::init(utils::logging::LogFormat::Plain) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}
