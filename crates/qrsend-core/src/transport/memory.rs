//! 进程内网络
//!
//! 多个 [`MemorySignaling`] 共享同一个 [`MemoryNetwork`] 注册表，
//! 连接在进程内通过 mpsc 转发，行为与真实传输一致:
//! 未注册的目标 ID 返回 `PeerUnavailable`，任一端关闭后双方都会收到 `ChannelClosed`。

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{
    ChannelHandle, ChannelId, EventSink, Outbound, SignalErrorKind, Signaling, TransportError,
    TransportEvent,
};
use crate::session::ConnectionDescriptor;

/// 进程内注册表里使用的地址
pub const MEMORY_ADDRESS: &str = "memory://local/";

/// 共享的进程内信令服务
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<String, EventSink>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个接入本网络的信令身份
    pub fn signaling(&self) -> MemorySignaling {
        MemorySignaling {
            network: self.clone(),
            local_id: None,
            events: None,
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// 模拟与信令服务断开: 注销 ID 并向该端报告 `Disconnected`
    pub fn disconnect(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(events) => {
                info!("Memory signaling: {id} disconnected");
                let _ = events.send(TransportEvent::SignalingError {
                    kind: SignalErrorKind::Disconnected,
                    detail: "lost connection to signaling".to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// 向已注册的端注入信令错误
    pub fn inject_error(&self, id: &str, kind: SignalErrorKind) -> bool {
        match self.lock().get(id) {
            Some(events) => events
                .send(TransportEvent::SignalingError {
                    kind,
                    detail: "injected".to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EventSink>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: &str, events: EventSink) {
        self.lock().insert(id.to_string(), events);
    }

    fn unregister(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lookup(&self, id: &str) -> Option<EventSink> {
        self.lock().get(id).cloned()
    }
}

/// 进程内信令身份
#[derive(Debug)]
pub struct MemorySignaling {
    network: MemoryNetwork,
    local_id: Option<String>,
    events: Option<EventSink>,
}

impl MemorySignaling {
    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError> {
        let local_id = uuid::Uuid::new_v4().simple().to_string();
        self.network.register(&local_id, events.clone());
        info!("Memory signaling open as {local_id}");

        events
            .send(TransportEvent::SignalingOpened {
                local_id: local_id.clone(),
                address: MEMORY_ADDRESS.to_string(),
            })
            .map_err(|_| TransportError::ChannelClosed)?;

        self.local_id = Some(local_id);
        self.events = Some(events);
        Ok(())
    }

    fn connect(
        &mut self,
        target: &ConnectionDescriptor,
        channel: ChannelId,
    ) -> Result<ChannelHandle, TransportError> {
        let events = self
            .events
            .clone()
            .ok_or(TransportError::SignalingNotOpen)?;
        let remote_events = self
            .network
            .lookup(target.peer_id())
            .ok_or_else(|| TransportError::PeerUnavailable(target.peer_id().to_string()))?;

        let remote_channel = ChannelId::next();
        let (local, local_rx) = ChannelHandle::pair(channel);
        let (remote, remote_rx) = ChannelHandle::pair(remote_channel);
        debug!(
            "Memory channel {channel} <-> {remote_channel} to {}",
            target.peer_id()
        );

        let _ = remote_events.send(TransportEvent::Incoming(remote));
        let _ = remote_events.send(TransportEvent::ChannelOpened(remote_channel));
        let _ = events.send(TransportEvent::ChannelOpened(channel));

        tokio::spawn(pump(
            local_rx,
            Endpoint::new(channel, events.clone()),
            Endpoint::new(remote_channel, remote_events.clone()),
        ));
        tokio::spawn(pump(
            remote_rx,
            Endpoint::new(remote_channel, remote_events),
            Endpoint::new(channel, events),
        ));

        Ok(local)
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let (Some(local_id), Some(events)) = (&self.local_id, &self.events) else {
            return Err(TransportError::SignalingNotOpen);
        };
        if !self.network.is_registered(local_id) {
            info!("Memory signaling: {local_id} re-registered");
            self.network.register(local_id, events.clone());
        }
        Ok(())
    }

    async fn destroy(&mut self) {
        if let Some(local_id) = self.local_id.take() {
            debug!("Memory signaling: {local_id} destroyed");
            self.network.unregister(&local_id);
        }
        self.events = None;
    }
}

struct Endpoint {
    channel: ChannelId,
    events: EventSink,
}

impl Endpoint {
    fn new(channel: ChannelId, events: EventSink) -> Self {
        Self { channel, events }
    }
}

/// 将一端写入的消息转发给另一端，结束时通知双方
async fn pump(mut outbound: mpsc::UnboundedReceiver<Outbound>, from: Endpoint, to: Endpoint) {
    while let Some(command) = outbound.recv().await {
        match command {
            // 转发后额度随 `_permit` 一起归还
            Outbound::Message(message, _permit) => {
                if to
                    .events
                    .send(TransportEvent::Message(to.channel, message))
                    .is_err()
                {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = to.events.send(TransportEvent::ChannelClosed(to.channel));
    let _ = from.events.send(TransportEvent::ChannelClosed(from.channel));
}
