//! upnp-portmap - UPnP 端口映射工具
//!
//! 主入口程序

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Args, Commands};
use upnp_portmap::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Commands::Config { path }) = &args.command {
        return commands::handle_generate_config(path.clone());
    }

    // 加载配置，命令行参数覆盖配置
    let config_path = Config::get_config_path(args.config.as_deref());
    let mut config = Config::load(&config_path)?;

    if let Some(port) = args.port {
        config.mapping.port = port;
    }
    if let Some(ref protocol) = args.protocol {
        config.mapping.protocol = commands::parse_protocol(protocol)?;
    }

    commands::init_logging(args.verbose, &config.logging.level);

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::handle_run(config).await,
        Commands::Discover { timeout } => commands::handle_discover(&config, timeout).await,
        Commands::ExternalIp { timeout } => commands::handle_external_ip(&config, timeout).await,
        Commands::List { timeout } => commands::handle_list(&config, timeout).await,
        Commands::Map { port, timeout } => commands::handle_map(&config, port, timeout).await,
        Commands::Unmap { port, timeout } => commands::handle_unmap(&config, port, timeout).await,
        Commands::Config { .. } => Ok(()),
    }
}
