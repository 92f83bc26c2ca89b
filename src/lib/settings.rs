use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "./config.toml";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub log_level: String,
    pub libvirt_uri: String,
}

impl Settings {
    /// Loads `CONFIG_FILE_PATH` (or `./config.toml`) if present, overridden by
    /// `VIRT_TUNER_*` environment variables.
    pub fn load() -> Result<Settings, ConfigError> {
        let cfg_file = match std::env::var("CONFIG_FILE_PATH") {
            Ok(s) => s,
            Err(_e) => DEFAULT_CONFIG_FILE.to_string(),
        };
        Settings::load_from(&cfg_file)
    }

    pub fn load_from(cfg_file: &str) -> Result<Settings, ConfigError> {
        Config::builder()
            .set_default("log_level", DEFAULT_LOG_LEVEL)?
            .set_default("libvirt_uri", DEFAULT_LIBVIRT_URI)?
            .add_source(File::with_name(cfg_file).required(false))
            .add_source(Environment::with_prefix("VIRT_TUNER").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
