//! SSDP 报文
//!
//! 搜索请求的构造，以及从网关应答中识别 WAN 服务和 Location 字段

use crate::nat::GatewayIdentity;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use url::{Host, Url};

/// SSDP 组播地址
pub const SSDP_MULTICAST: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

/// 默认搜索的组播地址：IPv4，以及链路本地、站点本地、组织本地三个 IPv6 范围
pub const SSDP_MULTICAST_GROUPS: [SocketAddr; 4] = [
    SSDP_MULTICAST,
    SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc)), 1900),
    SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc)), 1900),
    SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xff08, 0, 0, 0, 0, 0, 0, 0xc)), 1900),
];

/// 搜索全部服务的 M-SEARCH 请求
pub const SEARCH_REQUEST: &str =
    "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp: discover\"\r\nMX: 3\r\nST: ssdp:all\r\n\r\n";

/// 认可的网关服务标识；部分路由器省略版本号，所以只匹配前缀
pub const GATEWAY_SERVICE_MARKERS: [&str; 3] = [
    "urn:schemas-upnp-org:service:WANIPConnection:",
    "urn:schemas-upnp-org:device:InternetGatewayDevice:",
    "urn:schemas-upnp-org:service:WANPPPConnection:",
];

/// 应答中声明的网关服务 (大小写不敏感)
pub fn gateway_service(response: &str) -> Option<&'static str> {
    let lower = response.to_ascii_lowercase();
    GATEWAY_SERVICE_MARKERS
        .iter()
        .find(|marker| lower.contains(&marker.to_ascii_lowercase()))
        .copied()
}

/// 解析 Location 头，得到网关身份 (主机端点 + 描述路径)
///
/// 只接受以 IP 地址表示主机的 http 地址，没有端口时使用 80
pub fn parse_location(response: &str) -> Option<GatewayIdentity> {
    let location = response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("location").then(|| value.trim())
    })?;

    let url = Url::parse(location).ok()?;
    if url.scheme() != "http" {
        return None;
    }

    let ip = match url.host()? {
        Host::Ipv4(ip) => IpAddr::V4(ip),
        Host::Ipv6(ip) => IpAddr::V6(ip),
        Host::Domain(_) => return None,
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Some(GatewayIdentity {
        host: SocketAddr::new(ip, port),
        service_description_url: path,
    })
}
