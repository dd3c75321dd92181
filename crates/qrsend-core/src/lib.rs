//! qrsend Core Library
//!
//! 扫码直连的点对点文件传输核心库。
//!
//! 一端作为主机发布形如 `ws://<host>:<port>/#<peerId>` 的分享链接 (通常显示为二维码)，
//! 另一端打开链接后作为客户端直接连接，双方通过同一条可靠通道互发文件和聊天消息。
//!
//! # 模块
//!
//! - **protocol**: JSON 线格式 (`metadata`/`chunk`/`end`/`cancel`/心跳/聊天)
//! - **session**: 角色分配、连接重试、心跳、断线恢复
//! - **transfer**: 单飞发送队列、入站重组、进度/ETA
//! - **transport**: 信令/通道抽象，WebSocket 和进程内实现
//! - **peer**: 驱动以上组件的 tokio 任务
//! - **config**: 持久化设置
//!
//! # 使用示例
//!
//! ```ignore
//! use qrsend_core::{ChannelCallback, PeerOptions, WsOptions, WsSignaling, FileSource};
//!
//! let (callback, mut events) = ChannelCallback::new();
//! let signaling = WsSignaling::new(WsOptions::default());
//! let (handle, task) = qrsend_core::peer::spawn(signaling, PeerOptions::default(), Arc::new(callback));
//!
//! // 事件流中会出现 PeerEvent::Descriptor，把其中的链接展示给对方
//! handle.send_file(FileSource::from_path("report.pdf").await?)?;
//! ```

pub mod config;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

pub use config::AppSettings;
pub use logging::LogLevel;

// Peer re-exports
pub use peer::{
    ChannelCallback, PeerCallback, PeerError, PeerEvent, PeerHandle, PeerOptions, PeerSnapshot,
};

// Protocol re-exports
pub use protocol::{Message, ProtocolError, TransferId};

// Session re-exports
pub use session::{ConnectionDescriptor, ConnectionState, Role, SessionConfig};

// Transfer re-exports
pub use transfer::{Artifact, Direction, FileSource, TransferConfig, TransferProgress};

// Transport re-exports
pub use transport::memory::{MemoryNetwork, MemorySignaling};
pub use transport::ws::{WsOptions, WsSignaling};
pub use transport::{Signaling, TransportError};
