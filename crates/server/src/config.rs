use std::path::Path;

use anyhow::{Context, Result};
use relay_protocol::RelayConfig;

/// Load configuration from an optional TOML file, then overlay environment variables.
/// A missing file is not an error — the process is expected to run from env vars alone
/// in most deployments (containers, systemd units).
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: RelayConfig =
            toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;
        tracing::info!("loaded config from {}", path.display());
        config
    } else {
        tracing::debug!(
            "no config file at {}, starting from defaults + environment",
            path.display()
        );
        RelayConfig::default()
    };

    config.apply_env_overrides();
    Ok(config)
}
