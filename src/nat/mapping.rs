//! 端口映射描述
//!
//! 协议 + 内部端口 + 外部端口构成映射的身份，租期和描述不参与比较

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// 永久租期 (网关不会主动过期)
pub const PERMANENT_LIFETIME: u32 = u32::MAX;

/// 未找到映射时使用的端口值
pub const NOT_FOUND_PORT: i32 = -1;

/// 传输协议
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// SOAP 报文中的协议名
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = std::convert::Infallible;

    /// 网关返回的协议名大小写不一，除 TCP 外一律视为 UDP
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("TCP") {
            Ok(Protocol::Tcp)
        } else {
            Ok(Protocol::Udp)
        }
    }
}

/// 端口映射
#[derive(Debug, Clone)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub private_port: i32,
    pub public_port: i32,
    /// 租期 (秒)，0 表示使用网关默认值
    pub lifetime: u32,
    /// 过期时间，None 表示永不过期
    pub expiration: Option<SystemTime>,
    pub description: String,
}

impl PortMapping {
    /// 创建租期为 0 的映射
    pub fn new(protocol: Protocol, private_port: i32, public_port: i32) -> Self {
        Self::with_lifetime(protocol, private_port, public_port, 0)
    }

    /// 创建指定租期的映射，过期时间按当前时间推算
    pub fn with_lifetime(protocol: Protocol, private_port: i32, public_port: i32, lifetime: u32) -> Self {
        let now = SystemTime::now();
        let expiration = match lifetime {
            PERMANENT_LIFETIME => None,
            0 => Some(now),
            secs => Some(now + Duration::from_secs(secs as u64)),
        };

        Self {
            protocol,
            private_port,
            public_port,
            lifetime,
            expiration,
            description: String::new(),
        }
    }

    /// 设置描述
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 网关上不存在对应条目时返回的占位映射
    pub fn not_found(protocol: Protocol) -> Self {
        Self::new(protocol, NOT_FOUND_PORT, NOT_FOUND_PORT)
    }

    pub fn is_not_found(&self) -> bool {
        self.public_port == NOT_FOUND_PORT
    }

    pub fn is_expired(&self) -> bool {
        match self.expiration {
            Some(at) => at < SystemTime::now(),
            None => false,
        }
    }
}

impl PartialEq for PortMapping {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.private_port == other.private_port
            && self.public_port == other.public_port
    }
}

impl Eq for PortMapping {}

impl Hash for PortMapping {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.private_port.hash(state);
        self.public_port.hash(state);
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Protocol: {}, Public Port: {}, Private Port: {}, Description: {}, Lifetime: {}",
            self.protocol, self.public_port, self.private_port, self.description, self.lifetime
        )
    }
}
