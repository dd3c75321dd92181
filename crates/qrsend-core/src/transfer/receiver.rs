//! 入站传输重组
//!
//! 多个入站传输可以同时进行，按传输 ID 索引。一个入站传输只存在于
//! `metadata` 到 `end`（产出 [`Artifact`]）或 `cancel`/会话拆除（丢弃）之间。
//! 未知 ID 的 `chunk`/`end` 是取消竞争下的正常现象，直接忽略。

use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Instant;

use super::progress::TransferProgress;
use crate::protocol::{Message, TransferId};

/// 正在接收的文件
#[derive(Debug)]
pub struct InboundTransfer {
    id: TransferId,
    name: String,
    declared_size: u64,
    media_type: String,
    chunks: Vec<Vec<u8>>,
    received_bytes: u64,
    started_at: Instant,
}

impl InboundTransfer {
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// 接收完成的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: TransferId,
    pub name: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// 接收端需要调用方执行的动作
#[derive(Debug, Clone)]
pub enum ReceiverAction {
    /// 收到元数据，新传输开始
    Started {
        id: TransferId,
        name: String,
        size: u64,
    },
    Progress {
        id: TransferId,
        progress: TransferProgress,
    },
    /// 文件接收完成，交给存储/展示层
    Completed(Artifact),
    /// 传输被丢弃，移除对应的进度指示
    Cancelled(TransferId),
    /// 通过当前传输通道发送消息
    Send(Message),
}

/// 入站传输表
#[derive(Debug, Default)]
pub struct Receiver {
    transfers: HashMap<TransferId, InboundTransfer>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &TransferId) -> Option<&InboundTransfer> {
        self.transfers.get(id)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &InboundTransfer> {
        self.transfers.values()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// 处理文件传输消息 (`metadata`/`chunk`/`end`/`cancel`)，其他种类忽略
    pub fn handle(&mut self, message: Message, now: Instant) -> Vec<ReceiverAction> {
        match message {
            Message::Metadata {
                file_id,
                name,
                size,
                file_type,
            } => {
                if self.transfers.contains_key(&file_id) {
                    debug!("Metadata for {file_id} restarts an existing transfer");
                }
                info!("Receiving {name} ({size} bytes) as {file_id}");
                self.transfers.insert(
                    file_id.clone(),
                    InboundTransfer {
                        id: file_id.clone(),
                        name: name.clone(),
                        declared_size: size,
                        media_type: file_type,
                        chunks: Vec::new(),
                        received_bytes: 0,
                        started_at: now,
                    },
                );
                vec![ReceiverAction::Started {
                    id: file_id,
                    name,
                    size,
                }]
            }
            Message::Chunk { file_id, chunk } => {
                let Some(transfer) = self.transfers.get_mut(&file_id) else {
                    return Vec::new();
                };
                transfer.received_bytes += chunk.len() as u64;
                transfer.chunks.push(chunk);

                let progress = TransferProgress::compute(
                    transfer.received_bytes,
                    transfer.declared_size,
                    now.saturating_duration_since(transfer.started_at),
                );
                vec![ReceiverAction::Progress {
                    id: file_id,
                    progress,
                }]
            }
            Message::End { file_id } => {
                let Some(transfer) = self.transfers.remove(&file_id) else {
                    return Vec::new();
                };
                if transfer.received_bytes != transfer.declared_size {
                    warn!(
                        "{} finished with {} bytes, declared {}",
                        transfer.name, transfer.received_bytes, transfer.declared_size
                    );
                }
                info!("Received {} ({} bytes)", transfer.name, transfer.received_bytes);
                vec![ReceiverAction::Completed(Artifact {
                    id: transfer.id,
                    name: transfer.name,
                    media_type: transfer.media_type,
                    data: transfer.chunks.concat(),
                })]
            }
            Message::Cancel { file_id } => self.on_remote_cancel(&file_id),
            _ => Vec::new(),
        }
    }

    /// 对端取消了它正在发给我们的传输
    pub fn on_remote_cancel(&mut self, id: &TransferId) -> Vec<ReceiverAction> {
        match self.transfers.remove(id) {
            Some(transfer) => {
                info!("Transfer {} cancelled by peer", transfer.name);
                vec![ReceiverAction::Cancelled(transfer.id)]
            }
            None => Vec::new(),
        }
    }

    /// 本地取消一个入站传输，并通知对端停止发送
    pub fn cancel(&mut self, id: &TransferId) -> Vec<ReceiverAction> {
        match self.transfers.remove(id) {
            Some(transfer) => {
                info!("Cancelled receiving {}", transfer.name);
                vec![
                    ReceiverAction::Cancelled(transfer.id.clone()),
                    ReceiverAction::Send(Message::Cancel {
                        file_id: transfer.id,
                    }),
                ]
            }
            None => {
                debug!("Cancel for unknown inbound transfer {id}, ignored");
                Vec::new()
            }
        }
    }

    /// 会话拆除: 丢弃所有未完成的入站传输
    pub fn reset(&mut self) -> Vec<ReceiverAction> {
        self.transfers
            .drain()
            .map(|(id, _)| ReceiverAction::Cancelled(id))
            .collect()
    }
}
