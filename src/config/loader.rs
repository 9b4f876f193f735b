// Configuration loader
// Layers built-in defaults, ~/.agentlink/config.toml and AGENTLINK_* env vars

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::constants::{CONFIG_FILE_NAME, DATA_DIR_NAME, ENV_PREFIX};
use super::settings::Config;

/// Flat variables accepted in addition to the nested `AGENTLINK_A__B` form.
const FLAT_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("AGENTLINK_BUS_URL", "bus.base_url"),
    ("AGENTLINK_API_KEY", "bus.api_key"),
    ("AGENTLINK_MACHINE_ID", "machine_id"),
];

/// Default config file location (~/.agentlink/config.toml)
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(DATA_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load configuration from the default location.
pub fn load_config() -> Result<Config> {
    load_config_from(&default_config_path()?)
}

/// Load configuration using `path` as the (optional) config file.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut builder = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

    for (var, key) in FLAT_ENV_OVERRIDES {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                builder = builder
                    .set_override(*key, value)
                    .with_context(|| format!("Invalid override from {}", var))?;
            }
        }
    }

    let config: Config = builder
        .build()
        .with_context(|| format!("Failed to read configuration ({})", path.display()))?
        .try_deserialize()
        .context("Configuration has an unexpected shape")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

/// Write a default config file. Refuses to overwrite an existing one.
pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Config file already exists: {}", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let contents =
        toml::to_string_pretty(&Config::default()).context("Failed to serialize default config")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
