//! 对等端驱动
//!
//! 一个 tokio 任务独占 [`Session`]、发送队列 [`Sender`] 和接收表 [`Receiver`]，
//! 按顺序处理三类输入:
//!
//! - 用户命令 ([`PeerHandle`])
//! - 传输层事件 (信令、通道、消息)
//! - 内部事件 (定时器、心跳、数据块读取完成)
//!
//! 定时器和文件读取在独立任务中执行，完成后把结果投递回内部队列，
//! 状态只在驱动任务里修改。读取数据块前先领取通道的写入额度，
//! 对端接收慢时读取随之暂停，内存占用不随文件大小增长。

pub mod callback;

pub use callback::{ChannelCallback, PeerCallback, PeerEvent};

use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::{Message, TransferId};
use crate::session::{
    ConnectionDescriptor, ConnectionState, Role, Session, SessionAction, SessionConfig,
    SessionEvent, Timer,
};
use crate::transfer::{
    Direction, FileSource, JobStatus, Receiver, ReceiverAction, Sender, SenderAction,
    TransferConfig,
};
use crate::transport::{
    ChannelHandle, ChannelId, Signaling, SignalErrorKind, TransportError, TransportEvent,
    WritePermit,
};

/// 驱动错误
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Peer has stopped")]
    Stopped,
}

/// 对等端启动参数
#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    /// 启动链接；带 `#<peerId>` 片段时以客户端身份启动
    pub link: Option<String>,
}

/// 用户命令
#[derive(Debug)]
pub enum Command {
    Send(FileSource),
    CancelSend(TransferId),
    CancelReceive(TransferId),
    Chat { msg_id: String, text: String },
    BecomeHost,
    Snapshot(oneshot::Sender<PeerSnapshot>),
    Shutdown,
}

/// 出站任务概要
#[derive(Debug, Clone)]
pub struct OutboundSummary {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    pub sent: u64,
    pub status: JobStatus,
}

/// 入站传输概要
#[derive(Debug, Clone)]
pub struct InboundSummary {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    pub received: u64,
}

/// 驱动状态快照
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub role: Role,
    pub state: ConnectionState,
    pub descriptor: Option<ConnectionDescriptor>,
    pub outbound: Vec<OutboundSummary>,
    pub inbound: Vec<InboundSummary>,
}

/// 驱动任务的命令入口
#[derive(Debug, Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerHandle {
    fn command(&self, command: Command) -> Result<(), PeerError> {
        self.commands.send(command).map_err(|_| PeerError::Stopped)
    }

    /// 加入发送队列
    pub fn send_file(&self, source: FileSource) -> Result<(), PeerError> {
        self.command(Command::Send(source))
    }

    pub fn cancel_send(&self, id: TransferId) -> Result<(), PeerError> {
        self.command(Command::CancelSend(id))
    }

    pub fn cancel_receive(&self, id: TransferId) -> Result<(), PeerError> {
        self.command(Command::CancelReceive(id))
    }

    /// 发送聊天消息，返回消息 ID (用于匹配已读回执)
    pub fn chat(&self, text: impl Into<String>) -> Result<String, PeerError> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        self.command(Command::Chat {
            msg_id: msg_id.clone(),
            text: text.into(),
        })?;
        Ok(msg_id)
    }

    /// 客户端连接失败后手动切换为主机
    pub fn become_host(&self) -> Result<(), PeerError> {
        self.command(Command::BecomeHost)
    }

    pub async fn snapshot(&self) -> Result<PeerSnapshot, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| PeerError::Stopped)
    }

    pub fn shutdown(&self) -> Result<(), PeerError> {
        self.command(Command::Shutdown)
    }
}

/// 在后台任务中启动对等端
pub fn spawn<S>(
    signaling: S,
    options: PeerOptions,
    callback: Arc<dyn PeerCallback>,
) -> (PeerHandle, JoinHandle<()>)
where
    S: Signaling + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Peer::new(signaling, options, callback);
    let task = tokio::spawn(peer.run(rx));
    (PeerHandle { commands: tx }, task)
}

/// 驱动内部事件
#[derive(Debug)]
enum DriverEvent {
    Timer(Timer),
    HeartbeatTick,
    ChunkRead {
        ticket: u64,
        result: io::Result<Vec<u8>>,
        permit: Option<WritePermit>,
    },
}

enum Next {
    Command(Option<Command>),
    Transport(TransportEvent),
    Driver(DriverEvent),
}

/// 对等端驱动
pub struct Peer<S: Signaling> {
    signaling: S,
    session: Session,
    sender: Sender,
    receiver: Receiver,
    callback: Arc<dyn PeerCallback>,
    channels: HashMap<ChannelId, ChannelHandle>,
    heartbeat: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    net_tx: mpsc::UnboundedSender<TransportEvent>,
    net_rx: mpsc::UnboundedReceiver<TransportEvent>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    events_rx: mpsc::UnboundedReceiver<DriverEvent>,
}

impl<S: Signaling> Peer<S> {
    pub fn new(signaling: S, options: PeerOptions, callback: Arc<dyn PeerCallback>) -> Self {
        let target = ConnectionDescriptor::target_from_link(options.link.as_deref());
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            signaling,
            session: Session::new(options.session, target),
            sender: Sender::new(options.transfer.chunk_size),
            receiver: Receiver::new(),
            callback,
            channels: HashMap::new(),
            heartbeat: None,
            timers: Vec::new(),
            net_tx,
            net_rx,
            events_tx,
            events_rx,
        }
    }

    /// 运行直到收到 `Shutdown` 或所有句柄被丢弃
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let actions = self.session.start();
        self.apply_session(actions).await;

        loop {
            let next = tokio::select! {
                command = commands.recv() => Next::Command(command),
                Some(event) = self.net_rx.recv() => Next::Transport(event),
                Some(event) = self.events_rx.recv() => Next::Driver(event),
            };

            match next {
                Next::Command(None | Some(Command::Shutdown)) => break,
                Next::Command(Some(command)) => self.on_command(command).await,
                Next::Transport(event) => self.on_transport(event).await,
                Next::Driver(event) => self.on_driver(event).await,
            }
        }

        self.shutdown().await;
    }

    async fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Send(source) => {
                let name = source.name().to_string();
                let size = source.size();
                let (id, actions) = self.sender.enqueue(source, now);
                self.callback.on_queued(&id, &name, size);
                self.apply_sender(actions);
            }
            Command::CancelSend(id) => {
                let actions = self.sender.cancel(&id, now);
                self.apply_sender(actions);
            }
            Command::CancelReceive(id) => {
                let actions = self.receiver.cancel(&id);
                self.apply_receiver(actions);
            }
            Command::Chat { msg_id, text } => {
                if self.session.state() == ConnectionState::Connected {
                    self.send(Message::ChatText { msg_id, text });
                } else {
                    self.callback.on_status("Not connected");
                }
            }
            Command::BecomeHost => {
                let actions = self.session.handle(SessionEvent::BecomeHost);
                self.apply_session(actions).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        let session_event = match event {
            TransportEvent::SignalingOpened { local_id, address } => {
                SessionEvent::SignalingOpened { local_id, address }
            }
            TransportEvent::SignalingError { kind, detail } => {
                warn!("Signaling error ({kind}): {detail}");
                SessionEvent::SignalingError(kind)
            }
            TransportEvent::Incoming(handle) => {
                let id = handle.id();
                self.channels.insert(id, handle);
                SessionEvent::IncomingConnection(id)
            }
            TransportEvent::ChannelOpened(id) => SessionEvent::ChannelOpened(id),
            TransportEvent::Message(id, message) => {
                self.on_message(id, message).await;
                return;
            }
            TransportEvent::ChannelClosed(id) => {
                self.channels.remove(&id);
                SessionEvent::ChannelClosed(id)
            }
            TransportEvent::ChannelError(id, reason) => {
                if let Some(handle) = self.channels.remove(&id) {
                    handle.close();
                }
                SessionEvent::ChannelError(id, reason)
            }
        };

        let actions = self.session.handle(session_event);
        self.apply_session(actions).await;
    }

    async fn on_driver(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Timer(timer) => {
                let actions = self.session.handle(SessionEvent::TimerFired(timer));
                self.apply_session(actions).await;
            }
            DriverEvent::HeartbeatTick => {
                let actions = self.session.handle(SessionEvent::HeartbeatTick);
                self.apply_session(actions).await;
            }
            DriverEvent::ChunkRead {
                ticket,
                result,
                permit,
            } => {
                let actions = self.sender.on_chunk_read(ticket, result, Instant::now());
                self.apply_sender_with(actions, permit);
            }
        }
    }

    async fn on_message(&mut self, channel: ChannelId, message: Message) {
        if !self.session.is_active(channel) {
            debug!("Dropping {} from inactive {channel}", message.kind());
            return;
        }

        if let Some(actions) = self.session.handle_control(&message) {
            self.apply_session(actions).await;
            return;
        }

        let now = Instant::now();
        match message {
            Message::Cancel { file_id } => {
                // 取消可能针对任一方向
                let actions = self.sender.on_remote_cancel(&file_id, now);
                self.apply_sender(actions);
                let actions = self.receiver.on_remote_cancel(&file_id);
                self.apply_receiver(actions);
            }
            message @ (Message::Metadata { .. } | Message::Chunk { .. } | Message::End { .. }) => {
                let actions = self.receiver.handle(message, now);
                self.apply_receiver(actions);
            }
            Message::ChatText { msg_id, text } => {
                self.callback.on_chat(&msg_id, &text);
                self.send(Message::ChatRead { msg_id });
            }
            Message::ChatRead { msg_id } => self.callback.on_chat_read(&msg_id),
            other => debug!("Ignoring {} message", other.kind()),
        }
    }

    /// 执行会话动作，会话后续事件追加到同一个队列
    async fn apply_session(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::OpenSignaling => {
                    if let Err(e) = self.signaling.open(self.net_tx.clone()).await {
                        error!("Failed to open signaling: {e}");
                        queue.extend(
                            self.session
                                .handle(SessionEvent::SignalingOpenFailed(e.to_string())),
                        );
                    }
                }
                SessionAction::DestroySignaling => {
                    self.cancel_timers();
                    self.signaling.destroy().await;
                }
                SessionAction::ReconnectSignaling => {
                    let event = match self.signaling.reconnect().await {
                        Ok(()) => SessionEvent::SignalingReconnected,
                        Err(e) => SessionEvent::SignalingReconnectFailed(e.to_string()),
                    };
                    queue.extend(self.session.handle(event));
                }
                SessionAction::PublishDescriptor(descriptor) => {
                    info!("Share link: {descriptor}");
                    self.callback.on_descriptor(&descriptor);
                }
                SessionAction::Connect { channel, target } => {
                    match self.signaling.connect(&target, channel) {
                        Ok(handle) => {
                            self.channels.insert(channel, handle);
                        }
                        Err(TransportError::PeerUnavailable(id)) => {
                            debug!("Peer {id} is not registered");
                            queue.extend(self.session.handle(SessionEvent::SignalingError(
                                SignalErrorKind::PeerUnavailable,
                            )));
                        }
                        Err(e) => {
                            queue.extend(
                                self.session
                                    .handle(SessionEvent::ChannelError(channel, e.to_string())),
                            );
                        }
                    }
                }
                SessionAction::RejectChannel(channel) | SessionAction::CloseChannel(channel) => {
                    if let Some(handle) = self.channels.remove(&channel) {
                        handle.close();
                    }
                }
                SessionAction::Send(message) => {
                    self.send(message);
                }
                SessionAction::Schedule { timer, after } => self.schedule(timer, after),
                SessionAction::StartHeartbeat(interval) => self.start_heartbeat(interval),
                SessionAction::StopHeartbeat => self.stop_heartbeat(),
                SessionAction::LinkUp => {
                    let actions = self.sender.link_up(Instant::now());
                    self.apply_sender(actions);
                }
                SessionAction::TearDownTransfers => {
                    let actions = self.sender.reset();
                    self.apply_sender(actions);
                    let actions = self.receiver.reset();
                    self.apply_receiver(actions);
                }
                SessionAction::StateChanged(state) => self.callback.on_state(state),
                SessionAction::Status(status) => self.callback.on_status(&status),
                SessionAction::PeerReady(name) => self.callback.on_peer_ready(name.as_deref()),
                SessionAction::OfferHostFallback => self.callback.on_host_fallback(),
            }
        }
    }

    fn apply_sender(&mut self, actions: Vec<SenderAction>) {
        self.apply_sender_with(actions, None);
    }

    /// 执行发送动作；`permit` 是本批数据块已领取的写入额度
    ///
    /// 任一发送失败即停止本批: 活动任务放回队首，之后的发送、读取和完成
    /// 报告都不再执行，只保留取消和失败通知。
    fn apply_sender_with(&mut self, actions: Vec<SenderAction>, mut permit: Option<WritePermit>) {
        let mut link_lost = false;
        for action in actions {
            match action {
                SenderAction::Send(_)
                | SenderAction::ReadChunk { .. }
                | SenderAction::Progress { .. }
                | SenderAction::Finished(_)
                    if link_lost => {}
                SenderAction::Send(message) => {
                    let permit = match message {
                        Message::Chunk { .. } => permit.take(),
                        _ => None,
                    };
                    if !self.send_with(message, permit) {
                        self.sender.link_down();
                        link_lost = true;
                    }
                }
                SenderAction::ReadChunk {
                    ticket,
                    source,
                    offset,
                    len,
                } => {
                    let channel = self.active_handle().cloned();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        // 先领取写入额度，写端跟不上时读取暂停
                        let permit = match channel {
                            Some(handle) => match handle.reserve().await {
                                Ok(permit) => Some(permit),
                                Err(e) => {
                                    debug!("Chunk read {ticket} abandoned: {e}");
                                    return;
                                }
                            },
                            None => None,
                        };
                        let result = source.read_chunk(offset, len).await;
                        let _ = events.send(DriverEvent::ChunkRead {
                            ticket,
                            result,
                            permit,
                        });
                    });
                }
                SenderAction::Progress { id, progress } => {
                    self.callback
                        .on_progress(Direction::Outbound, &id, &progress);
                }
                SenderAction::Finished(id) => {
                    let actions = self.sender.on_finished(&id, Instant::now());
                    self.apply_sender(actions);
                }
                SenderAction::Sent(id) => self.callback.on_sent(&id),
                SenderAction::Cancelled(id) => self.callback.on_cancelled(Direction::Outbound, &id),
                SenderAction::Failed { id, reason } => self.callback.on_failed(&id, &reason),
            }
        }
    }

    fn apply_receiver(&mut self, actions: Vec<ReceiverAction>) {
        for action in actions {
            match action {
                ReceiverAction::Started { id, name, size } => {
                    self.callback.on_incoming(&id, &name, size);
                }
                ReceiverAction::Progress { id, progress } => {
                    self.callback.on_progress(Direction::Inbound, &id, &progress);
                }
                ReceiverAction::Completed(artifact) => self.callback.on_completed(artifact),
                ReceiverAction::Cancelled(id) => self.callback.on_cancelled(Direction::Inbound, &id),
                ReceiverAction::Send(message) => {
                    self.send(message);
                }
            }
        }
    }

    fn active_handle(&self) -> Option<&ChannelHandle> {
        self.session
            .active_channel()
            .and_then(|channel| self.channels.get(&channel))
    }

    /// 通过活动通道发送，没有可用通道时返回 false
    fn send(&self, message: Message) -> bool {
        self.send_with(message, None)
    }

    /// 写入失败按连接丢失处理: 向自身投递 `ChannelError`，由会话执行断线策略
    fn send_with(&self, message: Message, permit: Option<WritePermit>) -> bool {
        let Some(handle) = self.active_handle() else {
            debug!("No active channel, dropping {}", message.kind());
            return false;
        };
        match handle.send_with(message, permit) {
            Ok(()) => true,
            Err(e) => {
                warn!("Send on {} failed: {e}", handle.id());
                let _ = self
                    .net_tx
                    .send(TransportEvent::ChannelError(handle.id(), e.to_string()));
                false
            }
        }
    }

    fn schedule(&mut self, timer: Timer, after: Duration) {
        self.timers.retain(|task| !task.is_finished());
        let events = self.events_tx.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(DriverEvent::Timer(timer));
        }));
    }

    fn cancel_timers(&mut self) {
        for task in self.timers.drain(..) {
            task.abort();
        }
    }

    fn start_heartbeat(&mut self, interval: Duration) {
        self.stop_heartbeat();
        let events = self.events_tx.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                if events.send(DriverEvent::HeartbeatTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            role: self.session.role(),
            state: self.session.state(),
            descriptor: self.session.descriptor().cloned(),
            outbound: self
                .sender
                .jobs()
                .map(|job| OutboundSummary {
                    id: job.id().clone(),
                    name: job.source().name().to_string(),
                    size: job.source().size(),
                    sent: job.offset(),
                    status: job.status(),
                })
                .collect(),
            inbound: self
                .receiver
                .transfers()
                .map(|transfer| InboundSummary {
                    id: transfer.id().clone(),
                    name: transfer.name().to_string(),
                    size: transfer.declared_size(),
                    received: transfer.received_bytes(),
                })
                .collect(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down peer");
        self.stop_heartbeat();
        self.cancel_timers();
        for (_, handle) in self.channels.drain() {
            handle.close();
        }
        self.signaling.destroy().await;
    }
}
