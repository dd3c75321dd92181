//! 连接描述符
//!
//! 格式: `<address>#<peerId>`，例如 `ws://192.168.1.5:9000/#3f2a9c`
//!
//! 主机生成描述符后通过二维码或分享链接交给对方；打开链接的一方
//! 从 `#` 后的片段得到目标 ID，从而成为客户端。

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Link has no '#<peer id>' fragment")]
    MissingFragment,

    #[error("Link has an empty peer id")]
    EmptyPeerId,
}

/// 主机发布的连接信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    address: String,
    peer_id: String,
}

impl ConnectionDescriptor {
    pub fn new(address: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            peer_id: peer_id.into(),
        }
    }

    /// 解析分享链接
    pub fn parse(link: &str) -> Result<Self, DescriptorError> {
        let (address, peer_id) = link
            .trim()
            .split_once('#')
            .ok_or(DescriptorError::MissingFragment)?;
        if peer_id.is_empty() {
            return Err(DescriptorError::EmptyPeerId);
        }
        Ok(Self::new(address, peer_id))
    }

    /// 从启动链接中提取目标；没有片段表示以主机身份启动
    pub fn target_from_link(link: Option<&str>) -> Option<Self> {
        link.and_then(|l| Self::parse(l).ok())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// 可分享的完整链接
    pub fn link(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.peer_id)
    }
}
