//! UPnP 互联网网关 (IGD) 客户端
//!
//! - `codec`: SOAP 请求编码与应答解码
//! - `device`: 单个网关的 WANIPConnection 控制接口
//! - `searcher`: SSDP 网关搜索
//! - `transport`: HTTP 传输层

pub mod codec;
pub mod device;
pub mod searcher;
pub mod ssdp;
pub mod transport;
mod xml;

pub use device::{GatewayLocation, UpnpDevice, WAN_IP_CONNECTION};
pub use searcher::{SearchOptions, SearchState, UpnpSearcher};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
