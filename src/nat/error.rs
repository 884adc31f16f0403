//! 映射操作错误

use thiserror::Error;

/// 网关操作失败的原因
#[derive(Debug, Clone, Error)]
pub enum MappingError {
    /// 连接、超时、DNS 等传输层失败；没有可解析的响应体时携带 HTTP 状态码
    #[error("Transport error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Transport { status: Option<u16>, message: String },

    /// XML 格式错误或响应结构不符合预期
    #[error("Decode error: {0}")]
    Decode(String),

    /// 网关返回的 UPnP 错误
    #[error("Gateway fault {code}: {description}")]
    Fault { code: u32, description: String },

    /// 调用方参数错误
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MappingError {
    /// 网关错误码，或传输层的 HTTP 状态码
    pub fn code(&self) -> Option<u32> {
        match self {
            MappingError::Fault { code, .. } => Some(*code),
            MappingError::Transport { status, .. } => status.map(u32::from),
            _ => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, MappingError::Fault { .. })
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        MappingError::Decode(message.into())
    }
}

impl From<reqwest::Error> for MappingError {
    fn from(e: reqwest::Error) -> Self {
        MappingError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<quick_xml::Error> for MappingError {
    fn from(e: quick_xml::Error) -> Self {
        MappingError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_and_display() {
        let fault = MappingError::Fault {
            code: 718,
            description: "ConflictInMappingEntry".to_string(),
        };
        assert_eq!(fault.code(), Some(718));
        assert!(fault.is_fault());
        assert_eq!(fault.to_string(), "Gateway fault 718: ConflictInMappingEntry");

        let transport = MappingError::Transport {
            status: Some(503),
            message: "unavailable".to_string(),
        };
        assert_eq!(transport.code(), Some(503));
        assert_eq!(transport.to_string(), "Transport error (503): unavailable");

        let refused = MappingError::Transport {
            status: None,
            message: "connection refused".to_string(),
        };
        assert_eq!(refused.code(), None);
        assert_eq!(refused.to_string(), "Transport error: connection refused");

        assert_eq!(MappingError::decode("bad").code(), None);
    }
}
