//! 传输层边界
//!
//! 核心逻辑只依赖这里定义的抽象:
//!
//! - [`Signaling`]: 信令身份提供者，负责分配本地 ID、接受入站连接、发起出站连接
//! - [`ChannelHandle`]: 一条可靠、有序、基于消息的点对点通道的发送端
//! - [`TransportEvent`]: 信令和通道产生的所有事件，经同一个队列送达，保证顺序
//!
//! 实现:
//! - [`memory`]: 进程内网络，用于测试
//! - [`ws`]: 基于 WebSocket 的实现

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::protocol::Message;
use crate::session::ConnectionDescriptor;

/// 传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Signaling not open")]
    SignalingNotOpen,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// 通道标识，进程内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// 分配一个新的通道 ID
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// 信令层错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalErrorKind {
    /// 目标 ID 不存在
    PeerUnavailable,
    Network,
    ServerError,
    /// 与信令服务断开（可恢复）
    Disconnected,
}

impl fmt::Display for SignalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalErrorKind::PeerUnavailable => "peer-unavailable",
            SignalErrorKind::Network => "network",
            SignalErrorKind::ServerError => "server-error",
            SignalErrorKind::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// 传输层事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 信令身份已就绪
    SignalingOpened { local_id: String, address: String },
    /// 信令层错误
    SignalingError { kind: SignalErrorKind, detail: String },
    /// 新的入站连接；随后会收到它的 `ChannelOpened`
    Incoming(ChannelHandle),
    ChannelOpened(ChannelId),
    Message(ChannelId, Message),
    ChannelClosed(ChannelId),
    ChannelError(ChannelId, String),
}

/// 事件发送端
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// 每条通道上允许排队未写出的数据块数
pub const WRITE_WINDOW: usize = 2;

/// 通道写端指令
#[derive(Debug)]
pub enum Outbound {
    /// 待写消息；携带的写入额度在消息写出或丢弃时归还
    Message(Message, Option<WritePermit>),
    Close,
}

/// 数据块写入额度
#[derive(Debug)]
pub struct WritePermit {
    _permit: OwnedSemaphorePermit,
}

/// 通道发送句柄
///
/// 所有克隆被丢弃后通道自动关闭。写入队列本身不限长度，
/// 数据块通过 [`ChannelHandle::reserve`] 领取额度，额度用完时读取方等待写端。
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Outbound>,
    credits: Arc<Semaphore>,
}

impl ChannelHandle {
    /// 创建句柄和对应的写端接收器
    pub fn pair(id: ChannelId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_window(id, WRITE_WINDOW)
    }

    pub fn with_window(
        id: ChannelId,
        window: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            outbound: tx,
            credits: Arc::new(Semaphore::new(window.max(1))),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// 等待一个数据块写入额度
    pub async fn reserve(&self) -> Result<WritePermit, TransportError> {
        let permit = Arc::clone(&self.credits)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(WritePermit { _permit: permit })
    }

    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_with(message, None)
    }

    /// 发送消息，写入额度随消息一起交给写端
    pub fn send_with(
        &self,
        message: Message,
        permit: Option<WritePermit>,
    ) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Message(message, permit))
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// 信令身份提供者
#[async_trait]
pub trait Signaling: Send {
    /// 注册信令身份，成功后向 `events` 推送 [`TransportEvent::SignalingOpened`]
    ///
    /// 之后所有入站连接和通道事件也都推送到 `events`。
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError>;

    /// 发起到目标的连接
    ///
    /// 立即返回句柄；连接结果通过 `ChannelOpened`/`ChannelError` 异步报告。
    fn connect(
        &mut self,
        target: &ConnectionDescriptor,
        channel: ChannelId,
    ) -> Result<ChannelHandle, TransportError>;

    /// 保持本地 ID 不变，重新连接信令
    async fn reconnect(&mut self) -> Result<(), TransportError>;

    /// 销毁信令身份，返回后监听资源已释放，可以立即重新 `open`
    async fn destroy(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_write_window_blocks_until_chunk_written() {
        let (handle, mut rx) = ChannelHandle::with_window(ChannelId::next(), 1);

        let permit = handle.reserve().await.unwrap();
        handle.send_with(Message::HeartbeatPing, Some(permit)).unwrap();

        // 额度仍在排队的消息上
        assert!(
            timeout(Duration::from_millis(50), handle.reserve())
                .await
                .is_err()
        );

        // 写端取走并丢弃消息后额度归还
        let written = rx.recv().await;
        assert!(matches!(written, Some(Outbound::Message(Message::HeartbeatPing, Some(_)))));
        drop(written);
        assert!(
            timeout(Duration::from_millis(50), handle.reserve())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (handle, rx) = ChannelHandle::pair(ChannelId::next());
        drop(rx);
        assert!(!handle.is_open());
        assert!(matches!(
            handle.send(Message::HeartbeatPong),
            Err(TransportError::ChannelClosed)
        ));
    }
}
