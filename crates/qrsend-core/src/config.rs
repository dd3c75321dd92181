//! 应用配置和持久化
//!
//! 设置保存在 `<config_dir>/qrsend/settings.toml`，缺失的字段使用默认值。

use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogLevel;
use crate::session::{self, SessionConfig};
use crate::transfer::{CHUNK_SIZE, TransferConfig};
use crate::transport::ws::{DEFAULT_BIND, WsOptions};

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 设备名称（随 `ready` 发给对端）
    pub device_name: String,
    /// 监听地址
    pub bind_address: String,
    /// 写入分享链接的主机名，为空时自动探测
    pub advertise_host: Option<String>,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 数据块大小 (字节)
    pub chunk_size: usize,
    pub attempt_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub heartbeat_interval_secs: u64,
    pub max_missed_pongs: u32,
    pub log_level: LogLevel,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            bind_address: DEFAULT_BIND.to_string(),
            advertise_host: None,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            chunk_size: CHUNK_SIZE,
            attempt_timeout_secs: session::ATTEMPT_TIMEOUT.as_secs(),
            retry_delay_secs: session::RETRY_DELAY.as_secs(),
            max_retries: session::MAX_RETRIES,
            heartbeat_interval_secs: session::HEARTBEAT_INTERVAL.as_secs(),
            max_missed_pongs: session::MAX_MISSED_PONGS,
            log_level: LogLevel::Info,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qrsend")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {}", path.display());
                    return settings;
                }
                Err(e) => warn!("Failed to parse settings: {e}, using defaults"),
            },
            Err(e) => warn!("Failed to read settings file: {e}, using defaults"),
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_retries: self.max_retries,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            max_missed_pongs: self.max_missed_pongs,
            display_name: Some(self.device_name.clone()).filter(|name| !name.is_empty()),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size.max(1),
        }
    }

    pub fn ws_options(&self) -> anyhow::Result<WsOptions> {
        let bind: SocketAddr = self
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.bind_address))?;
        Ok(WsOptions {
            bind,
            advertise_host: self.advertise_host.clone().filter(|host| !host.is_empty()),
        })
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "qrsend".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.chunk_size, 64 * 1024);
        assert_eq!(settings.max_retries, 3);

        let session = settings.session_config();
        assert_eq!(session.attempt_timeout, Duration::from_secs(20));
        assert_eq!(session.retry_delay, Duration::from_secs(2));
        assert_eq!(session.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(session.max_missed_pongs, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let settings = AppSettings {
            device_name: "desk".to_string(),
            advertise_host: Some("192.168.1.7".to_string()),
            max_retries: 5,
            log_level: LogLevel::Debug,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        assert_eq!(AppSettings::load_from(&path), settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "device_name = \"phone\"\nmax_retries = 1\n").unwrap();

        let settings = AppSettings::load_from(&path);
        assert_eq!(settings.device_name, "phone");
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "not = [valid").unwrap();

        let settings = AppSettings::load_from(&path);
        assert_eq!(settings.max_retries, session::MAX_RETRIES);
    }

    #[test]
    fn test_ws_options() {
        let settings = AppSettings {
            bind_address: "127.0.0.1:0".to_string(),
            advertise_host: Some(String::new()),
            ..Default::default()
        };
        let options = settings.ws_options().unwrap();
        assert_eq!(options.bind.port(), 0);
        assert!(options.advertise_host.is_none());

        let bad = AppSettings {
            bind_address: "nowhere".to_string(),
            ..Default::default()
        };
        assert!(bad.ws_options().is_err());
    }
}
