use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn init(cli_level_override: Option<&str>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(resolve_log_level(cli_level_override)?)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("set up tracing subscriber: {err}"))?;

    Ok(())
}

/// Level filter for the session: the `--log_level` override when given,
/// `info` otherwise. `LevelFilter` parses its names case-insensitively.
fn resolve_log_level(cli_level_override: Option<&str>) -> anyhow::Result<LevelFilter> {
    let Some(raw) = cli_level_override else {
        return Ok(DEFAULT_LOG_LEVEL);
    };
    raw.trim()
        .parse::<LevelFilter>()
        .map_err(|_| anyhow!("`{raw}` is not a log level; try error, warn, info, debug, or trace"))
}
