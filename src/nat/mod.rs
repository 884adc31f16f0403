//! NAT 网关抽象
//!
//! 定义网关设备需要满足的能力接口、发现事件，以及维持端口映射的管理器

pub mod error;
pub mod manager;
pub mod mapping;

pub use error::MappingError;
pub use manager::NatManager;
pub use mapping::{PortMapping, Protocol, NOT_FOUND_PORT, PERMANENT_LIFETIME};

use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// 网关实例的身份
///
/// 由设备描述所在的主机端点和描述路径组成，用于去重和集合成员判断
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayIdentity {
    pub host: SocketAddr,
    pub service_description_url: String,
}

impl fmt::Display for GatewayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.service_description_url)
    }
}

/// NAT 网关能力接口
#[async_trait]
pub trait NatDevice: Send + Sync + fmt::Debug {
    fn identity(&self) -> &GatewayIdentity;

    /// 访问该网关所用的本机地址
    fn local_address(&self) -> IpAddr;

    /// 最近一次收到该网关应答的时间
    fn last_seen(&self) -> Instant;

    async fn external_address(&self) -> Result<IpAddr, MappingError>;

    /// 把映射指向本机地址
    async fn create_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError>;

    async fn delete_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError>;

    /// 按顺序列出网关上的全部映射
    async fn list_all_mappings(&self) -> Result<Vec<PortMapping>, MappingError>;

    /// 查询指定协议和外部端口的映射，不存在时返回 `PortMapping::not_found`
    async fn get_mapping(&self, protocol: Protocol, public_port: i32) -> Result<PortMapping, MappingError>;
}

/// 设备发现事件
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Found(std::sync::Arc<dyn NatDevice>),
    Lost(std::sync::Arc<dyn NatDevice>),
}

/// 网关搜索器
#[async_trait]
pub trait Searcher: Send + Sync {
    /// 开始搜索，已在搜索时不做任何事
    async fn start(&self) -> std::io::Result<()>;

    /// 停止周期搜索
    fn stop(&self);

    /// 订阅发现事件
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}
