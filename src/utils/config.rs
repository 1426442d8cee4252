//! 配置管理模块
//!
//! 服务配置与账户配置共用同一个 TOML 文件 (`config/exch_srv_cfg.toml`)：
//! - `[server]`                 监听地址、日志文件、心跳、队列大小
//! - `[rate_limit.<exchange>]`  各调用类型的最小调用间隔 (秒)
//! - `[[accounts]]` / `[endpoint.<exchange>]` 由 `account` 模块读取

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/exch_srv_cfg.toml";

/// 配置文件路径环境变量
pub const CONFIG_PATH_ENV: &str = "EXCH_SRV_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,

    /// exchange -> (call class -> seconds)
    #[serde(default)]
    pub rate_limit: HashMap<String, HashMap<String, f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// 心跳周期，余额流 REST 轮询超时 = 30 × 心跳
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: f64,
    /// 订阅队列初始容量
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// 全局限频锁存的冷却时间
    #[serde(default = "default_rate_limit_reset_secs")]
    pub rate_limit_reset_secs: u64,
    /// 使用内置模拟盘适配器
    #[serde(default = "default_paper_trading")]
    pub paper_trading: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    50051
}

fn default_log_file() -> PathBuf {
    PathBuf::from("log/exch_srv.log")
}

fn default_heartbeat_secs() -> f64 {
    1.0
}

fn default_max_queue_size() -> usize {
    100
}

fn default_rate_limit_reset_secs() -> u64 {
    30
}

fn default_paper_trading() -> bool {
    true
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_file: default_log_file(),
            heartbeat_secs: default_heartbeat_secs(),
            max_queue_size: default_max_queue_size(),
            rate_limit_reset_secs: default_rate_limit_reset_secs(),
            paper_trading: default_paper_trading(),
        }
    }
}

impl ServerSection {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_secs.max(0.0))
    }

    pub fn rate_limit_reset(&self) -> Duration {
        Duration::from_secs(self.rate_limit_reset_secs)
    }

    /// `host:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ServerConfig {
    /// 从文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    /// 解析配置文件路径：命令行 `--config` > 环境变量 > 默认路径
    pub fn resolve_path(cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
