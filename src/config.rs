//! 配置管理模块
//!
//! 负责加载和管理应用程序配置

use crate::nat::manager::ManagerOptions;
use crate::nat::Protocol;
use crate::upnp::ssdp::SSDP_MULTICAST_GROUPS;
use crate::upnp::{SearchOptions, WAN_IP_CONNECTION};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// 应用程序配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 网关发现配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// 重新搜索周期 (秒)
    #[serde(default = "default_search_period")]
    pub search_period_secs: u64,
    /// 网关超过该时长无应答即移除 (秒)
    #[serde(default = "default_device_ttl")]
    pub device_ttl_secs: u64,
    /// 同一应答方获取描述的最小间隔 (秒)
    #[serde(default = "default_fetch_debounce")]
    pub fetch_debounce_secs: u64,
    /// HTTP 请求超时 (秒)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// 搜索请求发往的组播地址，默认包含 IPv4 组和三个 IPv6 范围的组；
    /// 没有 IPv6 的主机上 IPv6 组的发送失败只记录调试日志
    #[serde(default = "default_multicast_groups")]
    pub multicast_groups: Vec<String>,
    /// 需要网关提供的服务类型
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

/// 端口映射配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingConfig {
    /// 映射的端口 (内部端口与外部端口相同)
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// 映射描述前缀
    #[serde(default = "default_description")]
    pub description: String,
    /// 租期 (秒)，0 表示由网关决定
    #[serde(default)]
    pub lease_secs: u32,
    /// 检查映射是否存在的周期 (秒)
    #[serde(default = "default_check_period")]
    pub check_period_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            search_period_secs: default_search_period(),
            device_ttl_secs: default_device_ttl(),
            fetch_debounce_secs: default_fetch_debounce(),
            http_timeout_secs: default_http_timeout(),
            multicast_groups: default_multicast_groups(),
            service_type: default_service_type(),
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        MappingConfig {
            port: default_port(),
            protocol: Protocol::Tcp,
            description: default_description(),
            lease_secs: 0,
            check_period_secs: default_check_period(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

fn default_search_period() -> u64 {
    300 // 5 分钟
}

fn default_device_ttl() -> u64 {
    600 // 10 分钟
}

fn default_fetch_debounce() -> u64 {
    20
}

fn default_http_timeout() -> u64 {
    10
}

fn default_multicast_groups() -> Vec<String> {
    SSDP_MULTICAST_GROUPS.iter().map(|g| g.to_string()).collect()
}

fn default_service_type() -> String {
    WAN_IP_CONNECTION.to_string()
}

fn default_port() -> u16 {
    6881
}

fn default_description() -> String {
    "upnp-portmap".to_string()
}

fn default_check_period() -> u64 {
    600 // 10 分钟
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DiscoveryConfig {
    /// 转换为搜索参数，组播地址无法解析时报错
    pub fn search_options(&self) -> Result<SearchOptions> {
        let multicast_groups = self
            .multicast_groups
            .iter()
            .map(|group| {
                group
                    .parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("无效的组播地址 {}: {}", group, e))
            })
            .collect::<Result<Vec<_>>>()?;

        if multicast_groups.is_empty() {
            anyhow::bail!("至少需要一个组播地址");
        }

        Ok(SearchOptions {
            search_period: Duration::from_secs(self.search_period_secs),
            device_ttl: Duration::from_secs(self.device_ttl_secs),
            fetch_debounce: Duration::from_secs(self.fetch_debounce_secs),
            multicast_groups,
            service_type: self.service_type.clone(),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl MappingConfig {
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            protocol: self.protocol,
            description: self.description.clone(),
            lease: self.lease_secs,
            check_period: Duration::from_secs(self.check_period_secs),
        }
    }
}

impl Config {
    /// 从文件加载配置
    ///
    /// 如果文件不存在，返回默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!("配置文件不存在: {:?}, 使用默认配置", path);
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("配置文件解析失败: {}", e))?;

        tracing::info!("配置加载成功: {:?}", path);
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// 获取配置文件路径
    ///
    /// 优先级: 命令行指定 > 当前目录 > 用户主目录
    pub fn get_config_path(cli_path: Option<&str>) -> String {
        if let Some(p) = cli_path {
            return p.to_string();
        }

        if Path::new("upnp-portmap.toml").exists() {
            return "upnp-portmap.toml".to_string();
        }

        if let Ok(home) = std::env::var("HOME") {
            let config_path = format!("{}/.config/upnp-portmap/config.toml", home);
            if Path::new(&config_path).exists() {
                return config_path;
            }
        }

        "upnp-portmap.toml".to_string()
    }
}
