//! UPnP SOAP 编解码
//!
//! 纯函数：把一个动作编码成 HTTP 请求 (方法、头部、报文体)，
//! 或把响应体解码成类型化的消息。不做任何 I/O

use super::xml::XmlElement;
use crate::nat::{MappingError, PortMapping, Protocol};
use std::net::IpAddr;

/// UPnP 控制错误所在的命名空间
pub const CONTROL_NAMESPACE: &str = "urn:schemas-upnp-org:control-1-0";

/// 枚举映射时索引越界，表示列表已结束
pub const ARRAY_INDEX_INVALID: u32 = 713;

/// 指定条目不存在
pub const NO_SUCH_ENTRY_IN_ARRAY: u32 = 0x2ca;

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// 网关支持的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AddPortMapping {
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        internal_client: IpAddr,
        description: String,
        lease_duration: u32,
    },
    DeletePortMapping {
        protocol: Protocol,
        external_port: u16,
    },
    GetExternalIPAddress,
    GetGenericPortMappingEntry {
        index: u32,
    },
    GetSpecificPortMappingEntry {
        protocol: Protocol,
        external_port: u16,
    },
}

impl Action {
    /// 根据映射构造添加动作，端口越界属于调用方错误
    pub fn add(mapping: &PortMapping, internal_client: IpAddr) -> Result<Self, MappingError> {
        Ok(Action::AddPortMapping {
            protocol: mapping.protocol,
            external_port: port(mapping.public_port)?,
            internal_port: port(mapping.private_port)?,
            internal_client,
            description: mapping.description.clone(),
            lease_duration: mapping.lifetime,
        })
    }

    pub fn delete(mapping: &PortMapping) -> Result<Self, MappingError> {
        Ok(Action::DeletePortMapping {
            protocol: mapping.protocol,
            external_port: port(mapping.public_port)?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::AddPortMapping { .. } => "AddPortMapping",
            Action::DeletePortMapping { .. } => "DeletePortMapping",
            Action::GetExternalIPAddress => "GetExternalIPAddress",
            Action::GetGenericPortMappingEntry { .. } => "GetGenericPortMappingEntry",
            Action::GetSpecificPortMappingEntry { .. } => "GetSpecificPortMappingEntry",
        }
    }

    fn arguments(&self) -> Vec<(&'static str, String)> {
        match self {
            Action::AddPortMapping {
                protocol,
                external_port,
                internal_port,
                internal_client,
                description,
                lease_duration,
            } => vec![
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
                ("NewInternalPort", internal_port.to_string()),
                ("NewInternalClient", internal_client.to_string()),
                ("NewEnabled", "1".to_string()),
                ("NewPortMappingDescription", description.clone()),
                ("NewLeaseDuration", lease_duration.to_string()),
            ],
            Action::DeletePortMapping {
                protocol,
                external_port,
            }
            | Action::GetSpecificPortMappingEntry {
                protocol,
                external_port,
            } => vec![
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
            ],
            Action::GetExternalIPAddress => Vec::new(),
            Action::GetGenericPortMappingEntry { index } => {
                vec![("NewPortMappingIndex", index.to_string())]
            }
        }
    }
}

fn port(value: i32) -> Result<u16, MappingError> {
    u16::try_from(value)
        .map_err(|_| MappingError::Configuration(format!("port out of range: {}", value)))
}

/// 编码后的 HTTP 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapRequest {
    pub method: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// 把动作编码成 SOAP 1.1 请求，动作所在命名空间取自网关声明的服务类型
pub fn encode(service_type: &str, action: &Action) -> SoapRequest {
    let name = action.name();

    let mut arguments = String::new();
    for (key, value) in action.arguments() {
        arguments.push_str(&format!("<{key}>{}</{key}>", escape(&value)));
    }

    let body = format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{name} xmlns:u=\"{ns}\">{arguments}</u:{name}></s:Body>\
         </s:Envelope>\r\n\r\n",
        ns = escape(service_type),
    );

    SoapRequest {
        method: "POST",
        headers: vec![
            ("Content-Type".to_string(), SOAP_CONTENT_TYPE.to_string()),
            ("SOAPACTION".to_string(), format!("\"{}#{}\"", service_type, name)),
        ],
        body: body.into_bytes(),
    }
}

fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// 映射条目 (通用查询与指定查询共用)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMappingEntry {
    /// 仅通用查询返回
    pub remote_host: Option<String>,
    /// 仅通用查询返回
    pub external_port: Option<u16>,
    /// 仅通用查询返回
    pub protocol: Option<Protocol>,
    pub internal_port: u16,
    pub internal_client: String,
    pub enabled: bool,
    pub description: String,
    pub lease_duration: u32,
}

impl PortMappingEntry {
    /// 转换成映射描述；指定查询的响应不含协议和外部端口，由调用方补齐
    pub fn to_mapping(&self, protocol: Protocol, public_port: u16) -> PortMapping {
        PortMapping::with_lifetime(
            self.protocol.unwrap_or(protocol),
            self.internal_port as i32,
            self.external_port.unwrap_or(public_port) as i32,
            self.lease_duration,
        )
        .described(self.description.clone())
    }
}

/// 解码后的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    CreateMappingResponse,
    DeleteMappingResponse,
    ExternalIpResponse(IpAddr),
    GenericEntryResponse(PortMappingEntry),
    SpecificEntryResponse(PortMappingEntry),
    Fault { code: u32, description: String },
    /// 无法识别的响应元素
    Unrecognized(String),
}

/// 解码响应体
///
/// 先查找 UPnPError，再按响应元素名匹配已知动作。无法解析的报文是解码错误，
/// 能解析但不认识的结构返回 `Unrecognized`
pub fn decode(body: &str) -> Result<ProtocolMessage, MappingError> {
    let document = XmlElement::parse(body)?;

    if let Some(error) = document.find("UPnPError") {
        let code = error
            .child_text("errorCode")
            .ok_or_else(|| MappingError::decode("UPnPError without errorCode"))?;
        return Ok(ProtocolMessage::Fault {
            code: number(code, "errorCode")?,
            description: error.child_text("errorDescription").unwrap_or_default().to_string(),
        });
    }

    let response = document
        .find("Body")
        .and_then(|b| b.children.first())
        .unwrap_or(&document);

    let message = match response.name.as_str() {
        "AddPortMappingResponse" => ProtocolMessage::CreateMappingResponse,
        "DeletePortMappingResponse" => ProtocolMessage::DeleteMappingResponse,
        "GetExternalIPAddressResponse" => {
            let address = required(response, "NewExternalIPAddress")?;
            let address = address.parse::<IpAddr>().map_err(|_| {
                MappingError::decode(format!("invalid NewExternalIPAddress: {}", address))
            })?;
            ProtocolMessage::ExternalIpResponse(address)
        }
        "GetGenericPortMappingEntryResponse" => {
            ProtocolMessage::GenericEntryResponse(entry(response, true)?)
        }
        "GetSpecificPortMappingEntryResponse" => {
            ProtocolMessage::SpecificEntryResponse(entry(response, false)?)
        }
        other => ProtocolMessage::Unrecognized(other.to_string()),
    };

    Ok(message)
}

fn entry(element: &XmlElement, generic: bool) -> Result<PortMappingEntry, MappingError> {
    let (remote_host, external_port, protocol) = if generic {
        (
            Some(element.child_text("NewRemoteHost").unwrap_or_default().to_string()),
            Some(number(required(element, "NewExternalPort")?, "NewExternalPort")?),
            Some(
                required(element, "NewProtocol")?
                    .parse::<Protocol>()
                    .unwrap_or(Protocol::Udp),
            ),
        )
    } else {
        (None, None, None)
    };

    let enabled = required(element, "NewEnabled")?;

    Ok(PortMappingEntry {
        remote_host,
        external_port,
        protocol,
        internal_port: number(required(element, "NewInternalPort")?, "NewInternalPort")?,
        internal_client: required(element, "NewInternalClient")?.to_string(),
        enabled: enabled == "1" || enabled.eq_ignore_ascii_case("true"),
        description: element
            .child_text("NewPortMappingDescription")
            .unwrap_or_default()
            .to_string(),
        lease_duration: number(required(element, "NewLeaseDuration")?, "NewLeaseDuration")?,
    })
}

fn required<'a>(element: &'a XmlElement, name: &str) -> Result<&'a str, MappingError> {
    element
        .child_text(name)
        .ok_or_else(|| MappingError::decode(format!("{} missing {}", element.name, name)))
}

/// 十进制解析，与区域设置无关
fn number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T, MappingError> {
    value
        .parse::<T>()
        .map_err(|_| MappingError::decode(format!("invalid {}: {:?}", field, value)))
}
