//! Command handlers for upnp-portmap
//!
//! 每个子命令对应一个处理函数。一次性命令先搜索网关，再对找到的每个网关执行操作。

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use upnp_portmap::config::Config;
use upnp_portmap::nat::{NatDevice, NatManager, PortMapping, Protocol};
use upnp_portmap::upnp::{ReqwestTransport, UpnpDevice, UpnpSearcher};

/// 停止时等待删除映射的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize logging
///
/// RUST_LOG 优先；否则按 -v 级别，未指定时使用配置文件中的级别
pub fn init_logging(verbose: Option<u8>, default_level: &str) {
    let level = match verbose {
        Some(0) => "warn",
        Some(1) => "info",
        Some(2) => "debug",
        Some(_) => "trace",
        None => default_level,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
}

/// 解析命令行中的协议名
pub fn parse_protocol(name: &str) -> Result<Protocol> {
    match name.to_ascii_uppercase().as_str() {
        "TCP" => Ok(Protocol::Tcp),
        "UDP" => Ok(Protocol::Udp),
        _ => Err(anyhow!("不支持的协议: {} (应为 TCP 或 UDP)", name)),
    }
}

fn create_searcher(config: &Config) -> Result<Arc<UpnpSearcher>> {
    let transport = Arc::new(ReqwestTransport::new(config.discovery.http_timeout())?);
    let options = config.discovery.search_options()?;
    Ok(Arc::new(UpnpSearcher::new(options, transport)))
}

/// 搜索一段时间，返回期间确认的网关
async fn discover_devices(config: &Config, timeout: u64) -> Result<Vec<Arc<UpnpDevice>>> {
    let searcher = create_searcher(config)?;
    searcher.start().await?;

    println!("正在搜索 UPnP 网关 ({} 秒)...", timeout);
    tokio::time::sleep(Duration::from_secs(timeout)).await;

    let devices = searcher.devices();
    searcher.stop();

    if devices.is_empty() {
        println!("未发现 UPnP 网关");
    }
    Ok(devices)
}

/// 持续维持映射，直到收到 Ctrl+C
pub async fn handle_run(config: Config) -> Result<()> {
    let searcher = create_searcher(&config)?;
    let manager = NatManager::new(
        searcher,
        config.mapping.port,
        config.mapping.manager_options(),
    );

    info!(
        "维持端口映射 {} {} (描述前缀 \"{}\")",
        config.mapping.protocol, config.mapping.port, config.mapping.description
    );
    manager.start().await;

    signal::ctrl_c().await?;
    info!("收到退出信号，正在删除映射...");

    manager.stop();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, manager.flush()).await.is_err() {
        warn!("删除映射超时，部分网关上可能残留映射");
    }

    info!("upnp-portmap 已退出");
    Ok(())
}

/// Handle discover command
pub async fn handle_discover(config: &Config, timeout: u64) -> Result<()> {
    let devices = discover_devices(config, timeout).await?;

    for device in &devices {
        println!("网关: {}", device);
        println!("  控制地址: {}", device.control_url());
        println!("  服务类型: {}", device.service_type());
        println!("  本机地址: {}", device.local_address());
    }

    Ok(())
}

/// Handle external-ip command
pub async fn handle_external_ip(config: &Config, timeout: u64) -> Result<()> {
    for device in discover_devices(config, timeout).await? {
        match device.external_address().await {
            Ok(ip) => println!("{}: {}", device.identity(), ip),
            Err(e) => println!("{}: 查询失败: {}", device.identity(), e),
        }
    }
    Ok(())
}

/// Handle list command
pub async fn handle_list(config: &Config, timeout: u64) -> Result<()> {
    for device in discover_devices(config, timeout).await? {
        println!("网关: {}", device.identity());

        match device.list_all_mappings().await {
            Ok(mappings) if mappings.is_empty() => println!("  (无映射)"),
            Ok(mappings) => {
                for mapping in mappings {
                    println!("  {}", mapping);
                }
            }
            Err(e) => println!("  枚举映射失败: {}", e),
        }
    }
    Ok(())
}

/// Handle map command
pub async fn handle_map(config: &Config, port: u16, timeout: u64) -> Result<()> {
    let protocol = config.mapping.protocol;

    for device in discover_devices(config, timeout).await? {
        let description = format!("{}: {}", config.mapping.description, device.local_address());
        let mapping = PortMapping::with_lifetime(protocol, port as i32, port as i32, config.mapping.lease_secs)
            .described(description);

        match device.create_mapping(&mapping).await {
            Ok(()) => println!("✓ {}: 已添加 {}", device.identity(), mapping),
            Err(e) => println!("✗ {}: 添加失败: {}", device.identity(), e),
        }
    }
    Ok(())
}

/// Handle unmap command
pub async fn handle_unmap(config: &Config, port: u16, timeout: u64) -> Result<()> {
    let mapping = PortMapping::new(config.mapping.protocol, port as i32, port as i32);

    for device in discover_devices(config, timeout).await? {
        match device.delete_mapping(&mapping).await {
            Ok(()) => println!("✓ {}: 已删除 {} {}", device.identity(), mapping.protocol, port),
            Err(e) => println!("✗ {}: 删除失败: {}", device.identity(), e),
        }
    }
    Ok(())
}

/// Handle config command
pub fn handle_generate_config(path: Option<String>) -> Result<()> {
    let config_path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        PathBuf::from(Config::get_config_path(None))
    };

    println!("生成配置文件: {}", config_path.display());

    if config_path.exists() {
        println!("⚠ 配置文件已存在");
        print!("是否覆盖? (y/N): ");
        use std::io::Write;
        std::io::stdout().flush().ok();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).ok();
        if !input.trim().to_lowercase().starts_with('y') {
            println!("已取消");
            return Ok(());
        }
    }

    let default_config = Config::default();
    default_config
        .save(&config_path)
        .map_err(|e| anyhow!("写入配置文件失败: {}", e))?;

    println!("✓ 配置文件已生成: {}", config_path.display());
    println!();
    println!("配置内容:");
    println!("  映射端口: {} {}", default_config.mapping.protocol, default_config.mapping.port);
    println!("  映射描述: {}", default_config.mapping.description);
    println!("  搜索周期: {} 秒", default_config.discovery.search_period_secs);
    println!("  日志级别: {}", default_config.logging.level);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol() {
        assert_eq!(parse_protocol("tcp").unwrap(), Protocol::Tcp);
        assert_eq!(parse_protocol("UDP").unwrap(), Protocol::Udp);
        assert!(parse_protocol("sctp").is_err());
    }
}
