/// Whether to add the `target` field to the log lines.
#[derive(Clone, Copy)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("invalid log format. Expected 'plain' or 'json', got {s:?}"),
        }
    }
}

/// Initialize the global tracing subscriber. The filter is taken from
/// `RUST_LOG`, defaulting to `info`.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Plain => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    tracing::info!("logging initialized");
    Ok(())
}

/// Log a result at error level before discarding it.
pub fn log_on_error<T, E: std::fmt::Display>(result: Result<T, E>, what: &str) {
    if let Err(e) = result {
        tracing::error!("{what}: {e}");
    }
}
