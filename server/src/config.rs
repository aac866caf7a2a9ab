//! Configuration management for the server.

use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Root directory of the per-user stores
    pub data_dir: PathBuf,
    /// Base URL of the remote REST source, e.g. `https://example.my.salesforce.com`
    pub instance_url: String,
    /// Bearer token handed over by the identity layer
    pub access_token: String,
    pub org_id: String,
    pub user_id: String,
    /// JSON resource listing the soups to register at startup
    pub store_config: Option<PathBuf>,
    /// JSON resource listing the syncs to record at startup
    pub sync_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir = env::var("SOUPSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let instance_url = required("SOUPSYNC_INSTANCE_URL")?
            .trim_end_matches('/')
            .to_string();
        let access_token = required("SOUPSYNC_ACCESS_TOKEN")?;
        let org_id = required("SOUPSYNC_ORG_ID")?;
        let user_id = required("SOUPSYNC_USER_ID")?;

        Ok(Self {
            host,
            port,
            data_dir,
            instance_url,
            access_token,
            org_id,
            user_id,
            store_config: env::var("SOUPSYNC_STORE_CONFIG").ok().map(PathBuf::from),
            sync_config: env::var("SOUPSYNC_SYNC_CONFIG").ok().map(PathBuf::from),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid PORT value")]
    InvalidPort,
}
