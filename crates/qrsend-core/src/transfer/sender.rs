//! 发送队列
//!
//! 同一时刻最多只有一个任务处于发送状态，其余任务按 FIFO 顺序排队。
//! 发送流程:
//!
//! 1. 发送 `metadata` (id, 名称, 大小, MIME 类型)
//! 2. 顺序读取 64 KiB 数据块，每块发送一条 `chunk`
//! 3. 最后一块之后发送 `end`，调用方确认全部写入通道后调用
//!    [`Sender::on_finished`]，此时才报告完成并提升下一个排队任务
//!
//! [`Sender`] 本身不做 IO: 每个操作返回一组 [`SenderAction`]，由调用方执行。
//! 读取完成后调用方把结果交回 [`Sender::on_chunk_read`]，下一次读取只会在
//! 上一次完成之后发起，因此发送速度受限于读取速度。
//!
//! 被取消的任务立即移出活动位置。已发起的读取仍会完成，回调时通过读取票据
//! 判断结果是否属于当前活动任务，过期结果直接丢弃。

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io;
use std::time::Instant;

use super::progress::TransferProgress;
use super::source::FileSource;
use crate::protocol::{Message, TransferId};

/// 默认数据块大小
pub const CHUNK_SIZE: usize = 64 * 1024;

/// 发送任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Sending,
}

/// 出站传输任务
#[derive(Debug, Clone)]
pub struct TransferJob {
    id: TransferId,
    source: FileSource,
    status: JobStatus,
    offset: u64,
    started_at: Option<Instant>,
    /// 当前未完成读取的票据
    ticket: Option<u64>,
}

impl TransferJob {
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// 已发送字节数
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// 发送端需要调用方执行的动作
#[derive(Debug, Clone)]
pub enum SenderAction {
    /// 通过当前传输通道发送消息
    Send(Message),
    /// 读取下一个数据块，完成后以相同票据调用 [`Sender::on_chunk_read`]
    ReadChunk {
        ticket: u64,
        source: FileSource,
        offset: u64,
        len: usize,
    },
    /// 进度更新
    Progress {
        id: TransferId,
        progress: TransferProgress,
    },
    /// 最后的消息已交给通道；执行完此前的发送后调用 [`Sender::on_finished`]
    Finished(TransferId),
    /// 文件已全部发出
    Sent(TransferId),
    /// 任务已取消或被丢弃，移除对应的进度指示
    Cancelled(TransferId),
    /// 读取失败，任务已放弃
    Failed { id: TransferId, reason: String },
}

/// 单飞发送队列
#[derive(Debug)]
pub struct Sender {
    chunk_size: usize,
    queue: VecDeque<TransferJob>,
    active: Option<TransferJob>,
    link_up: bool,
    next_ticket: u64,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new(CHUNK_SIZE)
    }
}

impl Sender {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            queue: VecDeque::new(),
            active: None,
            link_up: false,
            next_ticket: 0,
        }
    }

    /// 当前正在发送的任务
    pub fn active(&self) -> Option<&TransferJob> {
        self.active.as_ref()
    }

    /// 排队中的任务 (按发送顺序)
    pub fn queued(&self) -> impl Iterator<Item = &TransferJob> {
        self.queue.iter()
    }

    /// 所有任务，活动任务在前
    pub fn jobs(&self) -> impl Iterator<Item = &TransferJob> {
        self.active.iter().chain(self.queue.iter())
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// 追加任务到队尾；若当前没有任务在发送则立即开始
    pub fn enqueue(&mut self, source: FileSource, now: Instant) -> (TransferId, Vec<SenderAction>) {
        let id = TransferId::generate();
        debug!(
            "Queued {} ({} bytes) as {}",
            source.name(),
            source.size(),
            id
        );
        self.queue.push_back(TransferJob {
            id: id.clone(),
            source,
            status: JobStatus::Pending,
            offset: 0,
            started_at: None,
            ticket: None,
        });
        let actions = self.pump(now);
        (id, actions)
    }

    /// 传输通道已打开，开始发送排队任务
    pub fn link_up(&mut self, now: Instant) -> Vec<SenderAction> {
        self.link_up = true;
        self.pump(now)
    }

    /// 传输通道不可用: 活动任务放回队首，从头重发
    pub fn link_down(&mut self) {
        self.link_up = false;
        if let Some(mut job) = self.active.take() {
            warn!("Connection lost while sending {}, requeued", job.id);
            job.status = JobStatus::Pending;
            job.offset = 0;
            job.started_at = None;
            job.ticket = None;
            self.queue.push_front(job);
        }
    }

    /// 会话拆除: 丢弃所有任务
    pub fn reset(&mut self) -> Vec<SenderAction> {
        self.link_up = false;
        self.jobs_drain()
            .map(|job| SenderAction::Cancelled(job.id))
            .collect()
    }

    fn jobs_drain(&mut self) -> impl Iterator<Item = TransferJob> + '_ {
        self.active.take().into_iter().chain(self.queue.drain(..))
    }

    /// 本地取消
    ///
    /// 取消活动任务会通知对端并立即提升下一个任务；
    /// 取消排队任务只需从队列移除，对端从未收到它的元数据。
    pub fn cancel(&mut self, id: &TransferId, now: Instant) -> Vec<SenderAction> {
        self.cancel_inner(id, true, now)
    }

    /// 对端发来 `cancel`，不再回发取消消息
    pub fn on_remote_cancel(&mut self, id: &TransferId, now: Instant) -> Vec<SenderAction> {
        self.cancel_inner(id, false, now)
    }

    fn cancel_inner(&mut self, id: &TransferId, notify_peer: bool, now: Instant) -> Vec<SenderAction> {
        if self.active.as_ref().is_some_and(|job| &job.id == id) {
            let mut actions = Vec::new();
            if let Some(job) = self.active.take() {
                info!("Cancelled active transfer {} at {} bytes", job.id, job.offset);
                if notify_peer && self.link_up {
                    actions.push(SenderAction::Send(Message::Cancel {
                        file_id: job.id.clone(),
                    }));
                }
                actions.push(SenderAction::Cancelled(job.id));
            }
            actions.extend(self.pump(now));
            return actions;
        }

        if let Some(pos) = self.queue.iter().position(|job| &job.id == id) {
            if let Some(job) = self.queue.remove(pos) {
                info!("Removed queued transfer {}", job.id);
                return vec![SenderAction::Cancelled(job.id)];
            }
        }

        debug!("Cancel for unknown outbound transfer {id}, ignored");
        Vec::new()
    }

    /// 读取完成回调
    pub fn on_chunk_read(
        &mut self,
        ticket: u64,
        result: io::Result<Vec<u8>>,
        now: Instant,
    ) -> Vec<SenderAction> {
        let chunk_size = self.chunk_size;
        let Some(job) = self.active.as_mut() else {
            debug!("Chunk read {ticket} completed with no active transfer, ignored");
            return Vec::new();
        };
        if job.ticket != Some(ticket) {
            debug!("Stale chunk read {ticket} for {}, ignored", job.id);
            return Vec::new();
        }
        job.ticket = None;

        let data = match result {
            Ok(data) if data.is_empty() && job.offset < job.source.size() => {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source ended before declared size",
                ))
            }
            other => other,
        };

        let data = match data {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read {}: {}", job.source.name(), e);
                let id = job.id.clone();
                self.active = None;
                let mut actions = vec![SenderAction::Failed {
                    id,
                    reason: e.to_string(),
                }];
                actions.extend(self.pump(now));
                return actions;
            }
        };

        job.offset += data.len() as u64;
        let elapsed = job
            .started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        let progress = TransferProgress::compute(job.offset, job.source.size(), elapsed);

        let mut actions = vec![
            SenderAction::Send(Message::Chunk {
                file_id: job.id.clone(),
                chunk: data,
            }),
            SenderAction::Progress {
                id: job.id.clone(),
                progress,
            },
        ];

        if job.offset >= job.source.size() {
            actions.push(SenderAction::Send(Message::End {
                file_id: job.id.clone(),
            }));
            actions.push(SenderAction::Finished(job.id.clone()));
        } else {
            let offset = job.offset;
            let len = remaining_len(job.source.size(), offset, chunk_size);
            let source = job.source.clone();
            let ticket = self.issue_ticket();
            if let Some(job) = self.active.as_mut() {
                job.ticket = Some(ticket);
            }
            actions.push(SenderAction::ReadChunk {
                ticket,
                source,
                offset,
                len,
            });
        }

        actions
    }

    /// 最后的 `end` 已写入通道: 报告完成并提升下一个任务
    pub fn on_finished(&mut self, id: &TransferId, now: Instant) -> Vec<SenderAction> {
        let done = self.active.as_ref().is_some_and(|job| {
            &job.id == id && job.ticket.is_none() && job.offset >= job.source.size()
        });
        if !done {
            debug!("Finish for {id} is no longer current, ignored");
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(job) = self.active.take() {
            info!("Finished sending {} ({} bytes)", job.source.name(), job.offset);
            actions.push(SenderAction::Sent(job.id));
        }
        actions.extend(self.pump(now));
        actions
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// 若通道可用且没有活动任务，提升队首任务
    fn pump(&mut self, now: Instant) -> Vec<SenderAction> {
        let mut actions = Vec::new();
        if !self.link_up || self.active.is_some() {
            return actions;
        }

        if let Some(mut job) = self.queue.pop_front() {
            job.status = JobStatus::Sending;
            job.offset = 0;
            job.started_at = Some(now);
            info!("Sending {} ({} bytes) as {}", job.source.name(), job.source.size(), job.id);

            actions.push(SenderAction::Send(Message::Metadata {
                file_id: job.id.clone(),
                name: job.source.name().to_string(),
                size: job.source.size(),
                file_type: job.source.media_type().to_string(),
            }));

            if job.source.size() == 0 {
                actions.push(SenderAction::Send(Message::End {
                    file_id: job.id.clone(),
                }));
                actions.push(SenderAction::Finished(job.id.clone()));
            } else {
                let ticket = self.issue_ticket();
                job.ticket = Some(ticket);
                actions.push(SenderAction::ReadChunk {
                    ticket,
                    source: job.source.clone(),
                    offset: 0,
                    len: remaining_len(job.source.size(), 0, self.chunk_size),
                });
            }
            self.active = Some(job);
        }

        actions
    }
}

fn remaining_len(size: u64, offset: u64, chunk_size: usize) -> usize {
    let remaining = size.saturating_sub(offset);
    usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size))
}
