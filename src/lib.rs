//! upnp-portmap - UPnP 端口映射库
//!
//! 通过 SSDP 发现局域网内的互联网网关设备 (IGD)，用 SOAP 控制接口
//! 在所有网关上维持同一条端口映射

pub mod config;

// 网关抽象和映射管理
pub mod nat;

// UPnP 协议实现
pub mod upnp;
