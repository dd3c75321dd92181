//! 文件传输模块
//!
//! 包含:
//! - 发送队列 (单飞发送、分块、取消)
//! - 入站传输重组
//! - 进度/ETA 计算

pub mod progress;
pub mod receiver;
pub mod sender;
pub mod source;

pub use progress::{TransferProgress, format_bytes, format_eta};
pub use receiver::{Artifact, InboundTransfer, Receiver, ReceiverAction};
pub use sender::{CHUNK_SIZE, JobStatus, Sender, SenderAction, TransferJob};
pub use source::FileSource;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }
}
