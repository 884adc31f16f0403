//! CLI argument definitions for upnp-portmap
//!
//! This module contains all command-line argument parsing logic.

use clap::{Parser, Subcommand};

/// upnp-portmap - 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// 配置文件路径
    #[arg(short, long, env = "UPNP_PORTMAP_CONFIG")]
    pub config: Option<String>,

    /// 日志级别 (0=warn, 1=info, 2=debug, 3=trace)
    #[arg(short, long)]
    pub verbose: Option<u8>,

    /// 映射端口 (覆盖配置文件)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// 映射协议 TCP/UDP (覆盖配置文件)
    #[arg(long)]
    pub protocol: Option<String>,
}

/// 子命令
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 持续维持端口映射，直到 Ctrl+C
    Run,

    /// 搜索局域网内的 UPnP 网关
    Discover {
        /// 等待网关应答的时长 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// 查询网关的公网地址
    ExternalIp {
        /// 等待网关应答的时长 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// 列出网关上的全部端口映射
    List {
        /// 等待网关应答的时长 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// 添加一条端口映射后退出
    Map {
        /// 外部端口 (内部端口相同)
        port: u16,

        /// 等待网关应答的时长 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// 删除一条端口映射
    Unmap {
        /// 外部端口
        port: u16,

        /// 等待网关应答的时长 (秒)
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// 生成配置文件
    Config {
        /// 配置文件路径
        #[arg(short, long)]
        path: Option<String>,
    },
}
