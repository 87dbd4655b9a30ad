//! JSON configuration for clients and the sync run.
//!
//! Wire field names are PascalCase. Durations are integer seconds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sync::SyncOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ClientType {
    Local,
    Webdav,
    YadiskRest,
    Yadisk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ClientConfig {
    pub base_dir: String,
    #[serde(rename = "Type")]
    pub client_type: ClientType,
    pub local_options: LocalOptions,
    pub webdav_options: WebdavOptions,
    pub yadisk_rest_options: YadiskRestOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_dir: String::new(),
            client_type: ClientType::Local,
            local_options: LocalOptions::default(),
            webdav_options: WebdavOptions::default(),
            yadisk_rest_options: YadiskRestOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LocalOptions {
    pub dir_mode: u32,
    pub file_mode: u32,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            file_mode: 0o644,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WebdavOptions {
    pub dav_uri: String,
    pub auth_token: String,
    pub auth_token_type: String,
    pub auth_user: String,
    pub auth_pass: String,
}

impl Default for WebdavOptions {
    fn default() -> Self {
        Self {
            dav_uri: String::new(),
            auth_token: String::new(),
            auth_token_type: "OAuth".to_string(),
            auth_user: String::new(),
            auth_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct YadiskRestOptions {
    pub api_uri: String,
    pub auth_token: String,
    pub delete_permanent: bool,
}

impl Default for YadiskRestOptions {
    fn default() -> Self {
        Self {
            api_uri: "https://cloud-api.yandex.net/v1/disk".to_string(),
            auth_token: String::new(),
            delete_permanent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SyncType {
    #[default]
    OneWay,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SyncConfig {
    #[serde(rename = "Type")]
    pub sync_type: SyncType,
    pub one_way: OneWayConfig,
}

/// Wire form of [`SyncOptions`]; durations are seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct OneWayConfig {
    pub ignore_existing: bool,
    pub indirect_upload: bool,
    pub upload_path_format: String,
    pub allow_delete: bool,
    pub single_threaded_file_size: i64,
    pub thread_count: usize,
    pub attempt_max: u32,
    pub attempt_delay: u64,
    pub upload_check_timeout: u64,
    pub upload_check_delay: u64,
}

impl Default for OneWayConfig {
    fn default() -> Self {
        let options = SyncOptions::default();
        Self {
            ignore_existing: options.ignore_existing,
            indirect_upload: options.indirect_upload,
            upload_path_format: options.upload_path_format,
            allow_delete: options.allow_delete,
            single_threaded_file_size: options.single_threaded_file_size,
            thread_count: options.thread_count,
            attempt_max: options.attempt_max,
            attempt_delay: options.attempt_delay.as_secs(),
            upload_check_timeout: options.upload_check_timeout.as_secs(),
            upload_check_delay: options.upload_check_delay.as_secs(),
        }
    }
}

impl OneWayConfig {
    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            ignore_existing: self.ignore_existing,
            indirect_upload: self.indirect_upload,
            upload_path_format: self.upload_path_format.clone(),
            allow_delete: self.allow_delete,
            single_threaded_file_size: self.single_threaded_file_size,
            thread_count: self.thread_count,
            attempt_max: self.attempt_max,
            attempt_delay: Duration::from_secs(self.attempt_delay),
            upload_check_timeout: Duration::from_secs(self.upload_check_timeout),
            upload_check_delay: Duration::from_secs(self.upload_check_delay),
        }
        .normalized()
    }
}

/// Load a client config. The file, when given, replaces the defaults;
/// the CLI base directory applies when the file does not set one.
pub fn load_client_config(
    path: Option<&Path>,
    base_dir: &str,
    default_type: ClientType,
) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig {
        client_type: default_type,
        ..ClientConfig::default()
    };
    if let Some(path) = path {
        config = read_json(path)?;
    }
    if config.base_dir.is_empty() {
        config.base_dir = base_dir.to_string();
    }
    Ok(config)
}

/// Load the sync config. CLI worker/attempt counts, when given, override
/// whatever the file says.
pub fn load_sync_config(
    path: Option<&Path>,
    threads: Option<usize>,
    attempts: Option<u32>,
) -> Result<SyncConfig, ConfigError> {
    let mut config = SyncConfig::default();
    if let Some(path) = path {
        config = read_json(path)?;
    }
    if let Some(threads) = threads {
        config.one_way.thread_count = threads;
    }
    if let Some(attempts) = attempts {
        config.one_way.attempt_max = attempts;
    }
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let display = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
        path: display,
        source,
    })
}
