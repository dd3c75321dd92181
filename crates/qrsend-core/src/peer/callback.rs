//! 对等端事件回调

use tokio::sync::mpsc;

use crate::protocol::TransferId;
use crate::session::{ConnectionDescriptor, ConnectionState};
use crate::transfer::{Artifact, Direction, TransferProgress};

/// 对等端事件回调
///
/// 所有方法都在驱动任务中同步调用，实现不应阻塞。
pub trait PeerCallback: Send + Sync {
    /// 状态文字
    fn on_status(&self, status: &str);
    /// 连接状态变化
    fn on_state(&self, state: ConnectionState);
    /// 主机描述符已发布 (可以展示二维码/分享链接)
    fn on_descriptor(&self, descriptor: &ConnectionDescriptor);
    /// 客户端重试耗尽，可以切换为主机
    fn on_host_fallback(&self);
    /// 对端已就绪
    fn on_peer_ready(&self, name: Option<&str>);
    /// 文件已加入发送队列
    fn on_queued(&self, id: &TransferId, name: &str, size: u64);
    /// 对端开始发送文件
    fn on_incoming(&self, id: &TransferId, name: &str, size: u64);
    fn on_progress(&self, direction: Direction, id: &TransferId, progress: &TransferProgress);
    /// 文件已全部发出
    fn on_sent(&self, id: &TransferId);
    /// 文件接收完成
    fn on_completed(&self, artifact: Artifact);
    /// 传输被取消或因会话拆除被丢弃
    fn on_cancelled(&self, direction: Direction, id: &TransferId);
    fn on_failed(&self, id: &TransferId, reason: &str);
    fn on_chat(&self, msg_id: &str, text: &str);
    fn on_chat_read(&self, msg_id: &str);
}

/// 转发到 mpsc 的事件
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Status(String),
    State(ConnectionState),
    Descriptor(ConnectionDescriptor),
    HostFallback,
    PeerReady(Option<String>),
    Queued {
        id: TransferId,
        name: String,
        size: u64,
    },
    Incoming {
        id: TransferId,
        name: String,
        size: u64,
    },
    Progress {
        direction: Direction,
        id: TransferId,
        progress: TransferProgress,
    },
    Sent(TransferId),
    Completed(Artifact),
    Cancelled {
        direction: Direction,
        id: TransferId,
    },
    Failed {
        id: TransferId,
        reason: String,
    },
    Chat {
        msg_id: String,
        text: String,
    },
    ChatRead(String),
}

/// 将回调转成事件流的简单实现
///
/// 使用无界通道，接收完成的文件不会因为消费方太慢而丢失。
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(event);
    }
}

impl PeerCallback for ChannelCallback {
    fn on_status(&self, status: &str) {
        self.emit(PeerEvent::Status(status.to_string()));
    }

    fn on_state(&self, state: ConnectionState) {
        self.emit(PeerEvent::State(state));
    }

    fn on_descriptor(&self, descriptor: &ConnectionDescriptor) {
        self.emit(PeerEvent::Descriptor(descriptor.clone()));
    }

    fn on_host_fallback(&self) {
        self.emit(PeerEvent::HostFallback);
    }

    fn on_peer_ready(&self, name: Option<&str>) {
        self.emit(PeerEvent::PeerReady(name.map(str::to_string)));
    }

    fn on_queued(&self, id: &TransferId, name: &str, size: u64) {
        self.emit(PeerEvent::Queued {
            id: id.clone(),
            name: name.to_string(),
            size,
        });
    }

    fn on_incoming(&self, id: &TransferId, name: &str, size: u64) {
        self.emit(PeerEvent::Incoming {
            id: id.clone(),
            name: name.to_string(),
            size,
        });
    }

    fn on_progress(&self, direction: Direction, id: &TransferId, progress: &TransferProgress) {
        self.emit(PeerEvent::Progress {
            direction,
            id: id.clone(),
            progress: *progress,
        });
    }

    fn on_sent(&self, id: &TransferId) {
        self.emit(PeerEvent::Sent(id.clone()));
    }

    fn on_completed(&self, artifact: Artifact) {
        self.emit(PeerEvent::Completed(artifact));
    }

    fn on_cancelled(&self, direction: Direction, id: &TransferId) {
        self.emit(PeerEvent::Cancelled {
            direction,
            id: id.clone(),
        });
    }

    fn on_failed(&self, id: &TransferId, reason: &str) {
        self.emit(PeerEvent::Failed {
            id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_chat(&self, msg_id: &str, text: &str) {
        self.emit(PeerEvent::Chat {
            msg_id: msg_id.to_string(),
            text: text.to_string(),
        });
    }

    fn on_chat_read(&self, msg_id: &str) {
        self.emit(PeerEvent::ChatRead(msg_id.to_string()));
    }
}
