use crate::services::janitor::JanitorConfig;
use serde::Deserialize;
use skiff_library::logging::LoggingConfig;
use std::sync::Arc;

/// Environment variables starting with this override configuration values, e.g. `SKIFF_AGENT__PORT=9000`
pub const AGENT_ENV_PREFIX: &str = "SKIFF_AGENT";

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// name for the server
    pub name: String,
    /// address to listen on
    pub address: String,
    /// port to listen on
    pub port: u16,
    /// request timeout length in seconds
    pub timeout_sec: u64,
    /// See documentation [here](https://docs.rs/tokio/latest/tokio/runtime/struct.Builder.html#method.event_interval) for details
    pub tokio_event_interval: Option<u32>,
    /// See documentation [here](https://docs.rs/tokio/latest/tokio/runtime/struct.Builder.html#method.global_queue_interval) for details
    pub tokio_queue_interval: Option<u32>,
    /// Worker threads for the tokio runtime, defaults to the number of cores
    pub tokio_threads: Option<usize>,
    pub logging: Arc<LoggingConfig>,
    pub transfer: Arc<TransferConfig>,
    pub update: Arc<UpdateConfig>,
    pub janitor: Arc<JanitorConfig>,
    pub runtime: Arc<RuntimeConfig>,
}

#[derive(Debug, Deserialize)]
/// Image and plugin transfers
pub struct TransferConfig {
    /// Bytes per content message, announced to clients when an upload starts
    pub chunk_size_bytes: u64,
    /// Uploads are assembled here, space is checked on this filesystem
    pub temp_dir: String,
    /// Finished plugin uploads wait here until installed
    pub plugin_staging_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfig {
    /// Ceiling on an update's runtime when the caller did not set a deadline
    pub default_deadline_sec: u64,
}

#[derive(Debug, Deserialize)]
/// The container engine on the device
pub struct RuntimeConfig {
    /// Absolute path, used for plugin management
    pub docker_cli: String,
    /// Absolute path, used to unpack plugin archives
    pub tar_cli: String,
    /// Grace period given to a container on a non-forced stop
    pub stop_timeout_sec: u64,
}

/// A wrapper type for the loaded global agent configuration
pub type AgentConfig = Arc<Configuration>;

impl Configuration {
    pub fn new(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> anyhow::Result<Self> {
        skiff_library::load_config_default!(
            "skiff_agent_library/src/agent.json",
            config_fpath,
            overrides,
            AGENT_ENV_PREFIX
        )
    }

    pub fn boxed(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> anyhow::Result<AgentConfig> {
        Ok(Arc::new(Configuration::new(config_fpath, overrides)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let cfg = Configuration::boxed(None, None).unwrap();
        assert_eq!(cfg.port, 8079);
        assert_eq!(cfg.transfer.chunk_size_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.janitor.interval_sec, 86400);
        assert_eq!(cfg.update.default_deadline_sec, 600);
    }

    #[test]
    fn overrides_win() {
        let cfg = Configuration::boxed(
            None,
            Some(vec![
                ("transfer.chunk_size_bytes".to_string(), "8".to_string()),
                ("janitor.enabled".to_string(), "false".to_string()),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.transfer.chunk_size_bytes, 8);
        assert!(!cfg.janitor.enabled);
    }
}
