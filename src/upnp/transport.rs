//! HTTP 传输
//!
//! 设备描述获取和 SOAP 控制请求都经过 `HttpTransport`，
//! 默认实现基于 reqwest

use super::codec::SoapRequest;
use crate::nat::MappingError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// HTTP 响应 (状态码 + 文本报文体)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP 传输接口
///
/// 只有连接层失败才返回错误；任何带响应的结果 (包括 4xx/5xx) 都以
/// `HttpResponse` 返回，网关的 SOAP 错误通常随 500 状态码一起到达
#[async_trait]
pub trait HttpTransport: Send + Sync + std::fmt::Debug {
    /// GET 请求
    async fn get(&self, url: &str) -> Result<HttpResponse, MappingError>;

    /// 发送已编码的 SOAP 请求
    async fn send(&self, url: &str, request: &SoapRequest) -> Result<HttpResponse, MappingError>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 创建指定超时的传输
    pub fn new(timeout: Duration) -> Result<Self, MappingError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, MappingError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn send(&self, url: &str, request: &SoapRequest) -> Result<HttpResponse, MappingError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| MappingError::Configuration(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! 测试用的内存网关

    use super::*;
    use std::sync::Mutex;

    /// 记录下来的请求
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: String,
        pub url: String,
        /// SOAPACTION 中 `#` 之后的动作名，GET 请求为空
        pub action: String,
        pub body: String,
    }

    type Handler = Box<dyn Fn(&RecordedRequest) -> Result<HttpResponse, MappingError> + Send + Sync>;

    /// 按处理函数应答并记录所有请求的传输
    pub struct MockTransport {
        handler: Handler,
        pub requests: Mutex<Vec<RecordedRequest>>,
    }

    impl std::fmt::Debug for MockTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockTransport").finish()
        }
    }

    impl MockTransport {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&RecordedRequest) -> Result<HttpResponse, MappingError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn handle(&self, request: RecordedRequest) -> Result<HttpResponse, MappingError> {
            let result = (self.handler)(&request);
            self.requests.lock().unwrap().push(request);
            result
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn get(&self, url: &str) -> Result<HttpResponse, MappingError> {
            self.handle(RecordedRequest {
                method: "GET".to_string(),
                url: url.to_string(),
                action: String::new(),
                body: String::new(),
            })
        }

        async fn send(&self, url: &str, request: &SoapRequest) -> Result<HttpResponse, MappingError> {
            let action = request
                .headers
                .iter()
                .find(|(name, _)| name == "SOAPACTION")
                .and_then(|(_, value)| value.trim_matches('"').split('#').nth(1))
                .unwrap_or_default()
                .to_string();

            self.handle(RecordedRequest {
                method: request.method.to_string(),
                url: url.to_string(),
                action,
                body: String::from_utf8_lossy(&request.body).into_owned(),
            })
        }
    }

    /// 包装成 SOAP 响应
    pub fn soap(inner: &str) -> HttpResponse {
        HttpResponse::ok(format!(
            "<?xml version=\"1.0\"?>\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <s:Body>{}</s:Body></s:Envelope>",
            inner
        ))
    }

    /// SOAP 错误响应 (HTTP 500)
    pub fn fault(code: u32, description: &str) -> HttpResponse {
        let mut response = soap(&format!(
            "<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>\
             <detail><UPnPError xmlns=\"urn:schemas-upnp-org:control-1-0\">\
             <errorCode>{}</errorCode><errorDescription>{}</errorDescription>\
             </UPnPError></detail></s:Fault>",
            code, description
        ));
        response.status = 500;
        response
    }

    /// 通用映射条目响应
    pub fn generic_entry(protocol: &str, external_port: u16, internal_port: u16, description: &str) -> HttpResponse {
        soap(&format!(
            "<u:GetGenericPortMappingEntryResponse xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">\
             <NewRemoteHost></NewRemoteHost><NewExternalPort>{}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol><NewInternalPort>{}</NewInternalPort>\
             <NewInternalClient>192.168.1.10</NewInternalClient><NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{}</NewPortMappingDescription>\
             <NewLeaseDuration>0</NewLeaseDuration>\
             </u:GetGenericPortMappingEntryResponse>",
            external_port, protocol, internal_port, description
        ))
    }

    /// 限定远端主机的映射条目响应
    pub fn remote_entry(remote_host: &str, protocol: &str, external_port: u16, internal_port: u16) -> HttpResponse {
        soap(&format!(
            "<u:GetGenericPortMappingEntryResponse xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">\
             <NewRemoteHost>{}</NewRemoteHost><NewExternalPort>{}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol><NewInternalPort>{}</NewInternalPort>\
             <NewInternalClient>192.168.1.10</NewInternalClient><NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>remote</NewPortMappingDescription>\
             <NewLeaseDuration>0</NewLeaseDuration>\
             </u:GetGenericPortMappingEntryResponse>",
            remote_host, external_port, protocol, internal_port
        ))
    }

    /// 从请求体中取出参数值
    pub fn argument(body: &str, name: &str) -> Option<String> {
        let open = format!("<{}>", name);
        let close = format!("</{}>", name);
        let start = body.find(&open)? + open.len();
        let end = body[start..].find(&close)? + start;
        Some(body[start..end].to_string())
    }
}
