//! 对等会话
//!
//! 负责角色分配、连接建立与重试、心跳保活，以及按角色区分的断线恢复。
//!
//! # 角色
//!
//! 启动链接带 `#<peerId>` 片段时为客户端，否则为主机。角色在一个会话代内不变。
//!
//! - **主机**: 信令就绪后发布连接描述符，被动等待；同一时间只接受一个入站连接。
//!   连接断开时只拆除当前会话，保留信令身份，回到等待状态。
//! - **客户端**: 信令就绪后立即连接目标 (20 秒超时)，失败后以 2 秒间隔最多重试 3 次，
//!   仍失败则进入 `Failed` 并提供"切换为主机"的手动回退。连接断开时整体重启为主机:
//!   清除目标、销毁信令身份、重新初始化。
//!
//! # 心跳
//!
//! 只有主机每 5 秒发送 `heartbeat-ping`，客户端回复 `heartbeat-pong`。
//! 主机连续 3 次未收到回复即视为连接已断开。
//!
//! # 信令不可用
//!
//! 打开信令失败 (例如端口被占用) 时按重试间隔重新打开，次数上限与连接重试相同，
//! 用尽后进入 `Failed`。
//!
//! [`Session`] 是纯状态机: `handle(event)` 返回 [`SessionAction`] 列表，由驱动层执行。

mod descriptor;

pub use descriptor::{ConnectionDescriptor, DescriptorError};

use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;

use crate::protocol::Message;
use crate::transport::{ChannelId, SignalErrorKind};

/// 单次连接尝试超时
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20);
/// 重试间隔
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
/// 最大重试次数
pub const MAX_RETRIES: u32 = 3;
/// 心跳间隔
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// 连续未应答的心跳上限
pub const MAX_MISSED_PONGS: u32 = 3;

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub heartbeat_interval: Duration,
    /// 为 0 时不检测心跳超时
    pub max_missed_pongs: u32,
    /// 随 `ready` 发送给对端的显示名称
    pub display_name: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: ATTEMPT_TIMEOUT,
            retry_delay: RETRY_DELAY,
            max_retries: MAX_RETRIES,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_missed_pongs: MAX_MISSED_PONGS,
            display_name: None,
        }
    }
}

/// 会话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    /// 主机等待入站连接
    AwaitingRemote,
    /// 客户端正在连接 (包括重试间隔)
    Connecting,
    Connected,
    /// 主机与信令断开，正在恢复
    Disconnected,
    /// 连接或信令重试耗尽
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::AwaitingRemote => "awaiting connection",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 会话定时器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    AttemptTimeout { attempt: u32 },
    Retry,
    /// 重新打开信令
    Reopen,
}

/// 会话输入事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignalingOpened { local_id: String, address: String },
    /// 打开信令失败
    SignalingOpenFailed(String),
    SignalingError(SignalErrorKind),
    SignalingReconnected,
    SignalingReconnectFailed(String),
    IncomingConnection(ChannelId),
    ChannelOpened(ChannelId),
    ChannelClosed(ChannelId),
    ChannelError(ChannelId, String),
    TimerFired(Timer),
    HeartbeatTick,
    /// 用户选择切换为主机
    BecomeHost,
}

/// 会话输出动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    OpenSignaling,
    DestroySignaling,
    ReconnectSignaling,
    PublishDescriptor(ConnectionDescriptor),
    Connect {
        channel: ChannelId,
        target: ConnectionDescriptor,
    },
    RejectChannel(ChannelId),
    CloseChannel(ChannelId),
    /// 通过活动通道发送
    Send(Message),
    Schedule { timer: Timer, after: Duration },
    StartHeartbeat(Duration),
    StopHeartbeat,
    /// 通道可用，传输可以开始
    LinkUp,
    /// 丢弃所有发送队列和入站传输
    TearDownTransfers,
    StateChanged(ConnectionState),
    Status(String),
    PeerReady(Option<String>),
    OfferHostFallback,
}

/// 会话状态机
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    role: Role,
    target: Option<ConnectionDescriptor>,
    local_id: Option<String>,
    descriptor: Option<ConnectionDescriptor>,
    state: ConnectionState,
    retry_count: u32,
    attempt: u32,
    pending: Option<ChannelId>,
    active: Option<ChannelId>,
    missed_pongs: u32,
    open_failures: u32,
    generation: u32,
}

impl Session {
    /// 有目标时为客户端，否则为主机
    pub fn new(config: SessionConfig, target: Option<ConnectionDescriptor>) -> Self {
        let role = if target.is_some() {
            Role::Client
        } else {
            Role::Host
        };
        Self {
            config,
            role,
            target,
            local_id: None,
            descriptor: None,
            state: ConnectionState::Initializing,
            retry_count: 0,
            attempt: 0,
            pending: None,
            active: None,
            missed_pongs: 0,
            open_failures: 0,
            generation: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn target(&self) -> Option<&ConnectionDescriptor> {
        self.target.as_ref()
    }

    pub fn descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// 每次客户端重启为主机时递增
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn active_channel(&self) -> Option<ChannelId> {
        self.active
    }

    pub fn is_active(&self, channel: ChannelId) -> bool {
        self.active == Some(channel)
    }

    /// 通道是否属于本会话 (活动或等待打开)
    pub fn tracks(&self, channel: ChannelId) -> bool {
        self.active == Some(channel) || self.pending == Some(channel)
    }

    pub fn start(&mut self) -> Vec<SessionAction> {
        info!("Starting session as {:?}", self.role);
        vec![
            SessionAction::StateChanged(self.state),
            SessionAction::Status("Initializing...".to_string()),
            SessionAction::OpenSignaling,
        ]
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        debug!("Session event {event:?} in {:?}", self.state);
        match event {
            SessionEvent::SignalingOpened { local_id, address } => {
                self.on_signaling_opened(local_id, address)
            }
            SessionEvent::SignalingOpenFailed(reason) => self.on_open_failed(&reason),
            SessionEvent::SignalingError(kind) => self.on_signaling_error(kind),
            SessionEvent::SignalingReconnected => {
                let mut actions = Vec::new();
                if self.role == Role::Host && self.state == ConnectionState::Disconnected {
                    self.set_state(ConnectionState::AwaitingRemote, &mut actions);
                    actions.push(SessionAction::Status("Ready".to_string()));
                }
                actions
            }
            SessionEvent::SignalingReconnectFailed(reason) => {
                warn!("Signaling reconnect failed: {reason}");
                vec![SessionAction::Status(format!("Connection lost ({reason})"))]
            }
            SessionEvent::IncomingConnection(channel) => self.on_incoming(channel),
            SessionEvent::ChannelOpened(channel) => self.on_channel_opened(channel),
            SessionEvent::ChannelClosed(channel) => self.on_channel_down(channel, "closed"),
            SessionEvent::ChannelError(channel, reason) => self.on_channel_down(channel, &reason),
            SessionEvent::TimerFired(Timer::AttemptTimeout { attempt }) => {
                if self.role == Role::Client && self.pending.is_some() && attempt == self.attempt {
                    self.attempt_failed("timeout")
                } else {
                    Vec::new()
                }
            }
            SessionEvent::TimerFired(Timer::Retry) => {
                if self.role == Role::Client
                    && self.state == ConnectionState::Connecting
                    && self.pending.is_none()
                {
                    self.begin_attempt()
                } else {
                    Vec::new()
                }
            }
            SessionEvent::TimerFired(Timer::Reopen) => {
                if self.local_id.is_none() && self.state == ConnectionState::Initializing {
                    vec![SessionAction::OpenSignaling]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::HeartbeatTick => self.on_heartbeat(),
            SessionEvent::BecomeHost => {
                if self.role == Role::Client && self.state != ConnectionState::Connected {
                    self.restart("Switching to host mode")
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// 拦截会话控制消息 (`ready`/心跳)
    ///
    /// 返回 `None` 表示消息不属于会话层，应交给传输组件处理。
    pub fn handle_control(&mut self, message: &Message) -> Option<Vec<SessionAction>> {
        match message {
            Message::Ready { name } => {
                info!("Peer ready ({})", name.as_deref().unwrap_or("unnamed"));
                Some(vec![
                    SessionAction::PeerReady(name.clone()),
                    SessionAction::Status("Ready!".to_string()),
                ])
            }
            Message::HeartbeatPing => Some(vec![SessionAction::Send(Message::HeartbeatPong)]),
            Message::HeartbeatPong => {
                self.missed_pongs = 0;
                Some(Vec::new())
            }
            _ => None,
        }
    }

    fn set_state(&mut self, state: ConnectionState, actions: &mut Vec<SessionAction>) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            actions.push(SessionAction::StateChanged(state));
        }
    }

    fn on_signaling_opened(&mut self, local_id: String, address: String) -> Vec<SessionAction> {
        info!("Signaling open, local id {local_id}");
        self.local_id = Some(local_id.clone());
        self.open_failures = 0;

        let mut actions = Vec::new();
        match self.role {
            Role::Host => {
                let descriptor = ConnectionDescriptor::new(address, local_id);
                self.descriptor = Some(descriptor.clone());
                actions.push(SessionAction::PublishDescriptor(descriptor));
                if self.active.is_none() {
                    self.set_state(ConnectionState::AwaitingRemote, &mut actions);
                    actions.push(SessionAction::Status("Ready".to_string()));
                }
            }
            Role::Client => {
                if self.state == ConnectionState::Initializing {
                    actions.extend(self.begin_attempt());
                }
            }
        }
        actions
    }

    fn begin_attempt(&mut self) -> Vec<SessionAction> {
        let Some(target) = self.target.clone() else {
            return Vec::new();
        };
        self.attempt += 1;
        let channel = ChannelId::next();
        self.pending = Some(channel);

        info!(
            "Connecting to {} (attempt {}, {channel})",
            target.peer_id(),
            self.attempt
        );

        let mut actions = Vec::new();
        self.set_state(ConnectionState::Connecting, &mut actions);
        if self.retry_count == 0 {
            actions.push(SessionAction::Status("Connecting...".to_string()));
        }
        actions.push(SessionAction::Connect { channel, target });
        actions.push(SessionAction::Schedule {
            timer: Timer::AttemptTimeout {
                attempt: self.attempt,
            },
            after: self.config.attempt_timeout,
        });
        actions
    }

    fn attempt_failed(&mut self, reason: &str) -> Vec<SessionAction> {
        let Some(channel) = self.pending.take() else {
            return Vec::new();
        };
        warn!("Connection attempt {} failed: {reason}", self.attempt);

        let mut actions = vec![SessionAction::CloseChannel(channel)];
        if self.retry_count < self.config.max_retries {
            self.retry_count += 1;
            actions.push(SessionAction::Status(format!("Retry {}", self.retry_count)));
            actions.push(SessionAction::Schedule {
                timer: Timer::Retry,
                after: self.config.retry_delay,
            });
        } else {
            self.set_state(ConnectionState::Failed, &mut actions);
            actions.push(SessionAction::Status("Failed to connect".to_string()));
            actions.push(SessionAction::OfferHostFallback);
        }
        actions
    }

    fn on_incoming(&mut self, channel: ChannelId) -> Vec<SessionAction> {
        if self.role == Role::Client || self.active.is_some() || self.pending.is_some() {
            info!("Rejecting incoming connection {channel}");
            return vec![SessionAction::RejectChannel(channel)];
        }
        self.pending = Some(channel);
        vec![SessionAction::Status("Incoming...".to_string())]
    }

    fn on_channel_opened(&mut self, channel: ChannelId) -> Vec<SessionAction> {
        if self.pending == Some(channel) {
            self.pending = None;
            self.retry_count = 0;
            return self.connected(channel);
        }
        if self.active == Some(channel) {
            return Vec::new();
        }
        debug!("Late open on {channel}, closing");
        vec![SessionAction::CloseChannel(channel)]
    }

    fn connected(&mut self, channel: ChannelId) -> Vec<SessionAction> {
        info!("Connected on {channel}");
        self.active = Some(channel);
        self.missed_pongs = 0;

        let mut actions = Vec::new();
        self.set_state(ConnectionState::Connected, &mut actions);
        actions.push(SessionAction::Status("Connected!".to_string()));
        actions.push(SessionAction::Send(Message::Ready {
            name: self.config.display_name.clone(),
        }));
        if self.role == Role::Host {
            actions.push(SessionAction::StartHeartbeat(self.config.heartbeat_interval));
        }
        actions.push(SessionAction::LinkUp);
        actions
    }

    fn on_channel_down(&mut self, channel: ChannelId, reason: &str) -> Vec<SessionAction> {
        if self.pending == Some(channel) {
            match self.role {
                Role::Client => self.attempt_failed(reason),
                Role::Host => {
                    info!("Incoming connection {channel} dropped before opening: {reason}");
                    self.pending = None;
                    vec![SessionAction::CloseChannel(channel)]
                }
            }
        } else if self.active == Some(channel) {
            self.disconnect(reason)
        } else {
            debug!("Ignoring {reason} on stale {channel}");
            Vec::new()
        }
    }

    fn disconnect(&mut self, reason: &str) -> Vec<SessionAction> {
        warn!("Disconnected: {reason}");
        let mut actions = vec![SessionAction::StopHeartbeat];
        if let Some(channel) = self.active.take() {
            actions.push(SessionAction::CloseChannel(channel));
        }
        actions.push(SessionAction::TearDownTransfers);

        match self.role {
            Role::Host => {
                self.missed_pongs = 0;
                self.set_state(ConnectionState::AwaitingRemote, &mut actions);
                actions.push(SessionAction::Status("Disconnected. Ready...".to_string()));
                if let Some(descriptor) = &self.descriptor {
                    actions.push(SessionAction::PublishDescriptor(descriptor.clone()));
                }
            }
            Role::Client => actions.extend(self.restart("Disconnected")),
        }
        actions
    }

    /// 客户端整体重启为主机
    fn restart(&mut self, reason: &str) -> Vec<SessionAction> {
        info!("{reason}, restarting as host");
        let mut actions = Vec::new();
        if let Some(channel) = self.pending.take() {
            actions.push(SessionAction::CloseChannel(channel));
        }
        if let Some(channel) = self.active.take() {
            actions.push(SessionAction::StopHeartbeat);
            actions.push(SessionAction::CloseChannel(channel));
            actions.push(SessionAction::TearDownTransfers);
        }
        actions.push(SessionAction::DestroySignaling);

        let generation = self.generation + 1;
        *self = Session::new(self.config.clone(), None);
        self.generation = generation;

        actions.push(SessionAction::StateChanged(self.state));
        actions.push(SessionAction::Status(format!(
            "{reason}. Restarting as host..."
        )));
        actions.push(SessionAction::OpenSignaling);
        actions
    }

    fn on_open_failed(&mut self, reason: &str) -> Vec<SessionAction> {
        warn!("Failed to open signaling: {reason}");
        let mut actions = Vec::new();
        if self.open_failures < self.config.max_retries {
            self.open_failures += 1;
            actions.push(SessionAction::Status(format!(
                "Signaling unavailable ({reason}), retry {}",
                self.open_failures
            )));
            actions.push(SessionAction::Schedule {
                timer: Timer::Reopen,
                after: self.config.retry_delay,
            });
        } else {
            self.set_state(ConnectionState::Failed, &mut actions);
            actions.push(SessionAction::Status(format!(
                "Signaling unavailable: {reason}"
            )));
        }
        actions
    }

    fn on_signaling_error(&mut self, kind: SignalErrorKind) -> Vec<SessionAction> {
        warn!("Signaling error: {kind}");
        match (self.role, kind) {
            (Role::Client, SignalErrorKind::PeerUnavailable) => {
                self.attempt_failed("peer unavailable")
            }
            (Role::Host, SignalErrorKind::PeerUnavailable) => Vec::new(),
            (Role::Client, _) => self.restart(&format!("Signaling {kind}")),
            (Role::Host, SignalErrorKind::Disconnected) => {
                let mut actions = Vec::new();
                if self.active.is_none() {
                    self.set_state(ConnectionState::Disconnected, &mut actions);
                }
                actions.push(SessionAction::Status("Reconnecting...".to_string()));
                actions.push(SessionAction::ReconnectSignaling);
                actions
            }
            (Role::Host, _) => vec![
                SessionAction::Status("Network error, reconnecting...".to_string()),
                SessionAction::ReconnectSignaling,
            ],
        }
    }

    fn on_heartbeat(&mut self) -> Vec<SessionAction> {
        if self.role != Role::Host || self.active.is_none() {
            return Vec::new();
        }
        if self.config.max_missed_pongs > 0 && self.missed_pongs >= self.config.max_missed_pongs {
            return self.disconnect("heartbeat timeout");
        }
        self.missed_pongs += 1;
        vec![SessionAction::Send(Message::HeartbeatPing)]
    }
}
