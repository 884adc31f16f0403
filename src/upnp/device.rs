//! UPnP 网关设备
//!
//! 每个发现的网关对应一个 `UpnpDevice`，负责把映射操作变成一次 SOAP 往返
//! (枚举映射除外，它按索引逐页请求)

use super::codec::{self, Action, ProtocolMessage, ARRAY_INDEX_INVALID, NO_SUCH_ENTRY_IN_ARRAY};
use super::transport::HttpTransport;
use super::xml::XmlElement;
use crate::nat::{GatewayIdentity, MappingError, NatDevice, PortMapping, Protocol};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

/// WAN IP 连接服务类型
pub const WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// 单个网关最多枚举的映射条目数
const MAX_MAPPING_ENTRIES: u32 = 1024;

/// 从 SSDP 应答中得到、尚未确认能力的网关
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLocation {
    pub identity: GatewayIdentity,
    /// 收到应答的本机地址
    pub local_address: IpAddr,
    pub service_type: String,
}

impl GatewayLocation {
    /// 设备描述的完整地址
    pub fn description_url(&self) -> String {
        format!(
            "http://{}{}",
            self.identity.host, self.identity.service_description_url
        )
    }

    /// 获取设备描述并查找目标服务
    ///
    /// 返回 `Ok(None)` 表示网关没有声明该服务
    pub async fn fetch_description(
        self,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Option<UpnpDevice>, MappingError> {
        let url = self.description_url();
        debug!("{}: 获取服务列表 {}", self.identity.host, url);

        let response = transport.get(&url).await?;
        if response.status != 200 {
            return Err(MappingError::Transport {
                status: Some(response.status),
                message: format!("couldn't get services list from {}", url),
            });
        }

        let document = XmlElement::parse(&response.body)?;
        let Some(control_url) = find_control_url(&document, &self.service_type) else {
            return Ok(None);
        };

        let base = Url::parse(&format!("http://{}/", self.identity.host))
            .map_err(|e| MappingError::decode(e.to_string()))?;
        let control_url = base
            .join(&control_url)
            .map_err(|e| MappingError::decode(format!("invalid controlURL {}: {}", control_url, e)))?;
        if control_url.host_str() != base.host_str() || control_url.port() != base.port() {
            debug!(
                "{}: 控制地址指向其他主机: {}",
                self.identity.host, control_url
            );
        }

        Ok(Some(UpnpDevice::new(self, control_url.to_string(), transport)))
    }
}

/// 在 serviceList 中查找服务类型匹配的 controlURL
fn find_control_url(document: &XmlElement, service_type: &str) -> Option<String> {
    let mut lists = Vec::new();
    document.find_all("serviceList", &mut lists);

    lists
        .iter()
        .flat_map(|list| list.children.iter())
        .find(|service| {
            service
                .child_text("serviceType")
                .map(|t| t.eq_ignore_ascii_case(service_type))
                .unwrap_or(false)
        })
        .and_then(|service| service.child_text("controlURL"))
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

/// UPnP 网关
pub struct UpnpDevice {
    identity: GatewayIdentity,
    local_address: IpAddr,
    service_type: String,
    control_url: String,
    last_seen: Mutex<Instant>,
    transport: Arc<dyn HttpTransport>,
}

impl UpnpDevice {
    pub fn new(location: GatewayLocation, control_url: String, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            identity: location.identity,
            local_address: location.local_address,
            service_type: location.service_type,
            control_url,
            last_seen: Mutex::new(Instant::now()),
            transport,
        }
    }

    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// 刷新最近可见时间
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// 一次 SOAP 往返
    ///
    /// 非 2xx 的响应体仍会尝试解码 (SOAP 错误通常随 500 返回)；
    /// 解码不出 UPnP 错误时报告 HTTP 状态码
    async fn call(&self, action: &Action) -> Result<ProtocolMessage, MappingError> {
        debug!("{}: {} -> {}", self.identity.host, action.name(), self.control_url);

        let request = codec::encode(&self.service_type, action);
        let response = self.transport.send(&self.control_url, &request).await?;
        trace!("{}: 响应 {}: {}", self.identity.host, response.status, response.body);

        let decoded = codec::decode(&response.body);
        if response.is_success() {
            return decoded;
        }

        match decoded {
            Ok(fault @ ProtocolMessage::Fault { .. }) => Ok(fault),
            _ => Err(MappingError::Transport {
                status: Some(response.status),
                message: format!("{} failed", action.name()),
            }),
        }
    }

    /// 添加映射，内部客户端为指定地址
    pub async fn create_mapping_to(&self, mapping: &PortMapping, local_address: IpAddr) -> Result<(), MappingError> {
        let action = Action::add(mapping, local_address)?;
        match self.call(&action).await? {
            ProtocolMessage::CreateMappingResponse => Ok(()),
            other => Err(unexpected(&action, other)),
        }
    }
}

/// 把错误和意外响应统一成错误
fn unexpected(action: &Action, message: ProtocolMessage) -> MappingError {
    match message {
        ProtocolMessage::Fault { code, description } => MappingError::Fault { code, description },
        other => MappingError::decode(format!("unexpected response to {}: {:?}", action.name(), other)),
    }
}

#[async_trait]
impl NatDevice for UpnpDevice {
    fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }

    fn local_address(&self) -> IpAddr {
        self.local_address
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn external_address(&self) -> Result<IpAddr, MappingError> {
        let action = Action::GetExternalIPAddress;
        match self.call(&action).await? {
            ProtocolMessage::ExternalIpResponse(address) => Ok(address),
            other => Err(unexpected(&action, other)),
        }
    }

    async fn create_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError> {
        self.create_mapping_to(mapping, self.local_address).await
    }

    async fn delete_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError> {
        let action = Action::delete(mapping)?;
        match self.call(&action).await? {
            ProtocolMessage::DeleteMappingResponse => Ok(()),
            other => Err(unexpected(&action, other)),
        }
    }

    /// 从索引 0 开始逐页请求，直到网关返回 713
    ///
    /// 网关重复返回完全相同的条目时视为列表结束；同一外部端口可以因
    /// 远端主机或内部地址不同而出现多次
    async fn list_all_mappings(&self) -> Result<Vec<PortMapping>, MappingError> {
        let mut mappings = Vec::new();
        let mut seen = HashSet::new();

        for index in 0..MAX_MAPPING_ENTRIES {
            let action = Action::GetGenericPortMappingEntry { index };
            match self.call(&action).await? {
                ProtocolMessage::GenericEntryResponse(entry) => {
                    let mapping = entry.to_mapping(Protocol::Udp, 0);
                    if !seen.insert(entry) {
                        debug!(
                            "{}: 第 {} 页重复返回 {}，结束枚举",
                            self.identity.host, index, mapping
                        );
                        break;
                    }
                    mappings.push(mapping);
                }
                ProtocolMessage::Fault { code, .. } if code == ARRAY_INDEX_INVALID => break,
                other => return Err(unexpected(&action, other)),
            }
        }

        Ok(mappings)
    }

    async fn get_mapping(&self, protocol: Protocol, public_port: i32) -> Result<PortMapping, MappingError> {
        let external_port = u16::try_from(public_port)
            .map_err(|_| MappingError::Configuration(format!("port out of range: {}", public_port)))?;
        let action = Action::GetSpecificPortMappingEntry {
            protocol,
            external_port,
        };

        match self.call(&action).await? {
            ProtocolMessage::SpecificEntryResponse(entry) | ProtocolMessage::GenericEntryResponse(entry) => {
                Ok(entry.to_mapping(protocol, external_port))
            }
            ProtocolMessage::Fault { code, .. } if code == NO_SUCH_ENTRY_IN_ARRAY => {
                Ok(PortMapping::not_found(protocol))
            }
            other => Err(unexpected(&action, other)),
        }
    }
}

impl fmt::Debug for UpnpDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpnpDevice")
            .field("identity", &self.identity)
            .field("local_address", &self.local_address)
            .field("control_url", &self.control_url)
            .field("service_type", &self.service_type)
            .finish()
    }
}

impl fmt::Display for UpnpDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UpnpDevice - EndPoint: {}, Control Url: {}, Service Description Url: {}, Service Type: {}",
            self.identity.host, self.control_url, self.identity.service_description_url, self.service_type
        )
    }
}
