//! WebSocket 传输
//!
//! 每个端同时是一个小型 WebSocket 服务器:
//!
//! - 本地 ID 为随机 UUID，描述符地址为 `ws://<host>:<port>/`
//! - 入站连接必须带 `?peer=<本地 ID>`，否则以 HTTP 404 拒绝
//! - 出站连接拨号 `<address>?peer=<目标 ID>`，404 视为目标不可用
//!
//! 每条 WebSocket 连接承载一个通道，每帧一条 JSON 文本消息。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async, connect_async};

use super::{
    ChannelHandle, ChannelId, EventSink, Outbound, SignalErrorKind, Signaling, TransportError,
    TransportEvent,
};
use crate::protocol::Message;
use crate::session::ConnectionDescriptor;

/// 默认监听地址
pub const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);

/// WebSocket 信令配置
#[derive(Debug, Clone)]
pub struct WsOptions {
    pub bind: SocketAddr,
    /// 写入描述符的主机名；为空时自动探测局域网地址
    pub advertise_host: Option<String>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND,
            advertise_host: None,
        }
    }
}

/// 运行中的监听任务
#[derive(Debug)]
struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Listener {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// 通知监听任务退出并等待它释放端口
    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            debug!("Listener task ended abnormally: {e}");
        }
    }
}

/// WebSocket 信令身份
#[derive(Debug)]
pub struct WsSignaling {
    options: WsOptions,
    local_id: Option<String>,
    bound: Option<SocketAddr>,
    events: Option<EventSink>,
    listener: Option<Listener>,
}

impl WsSignaling {
    pub fn new(options: WsOptions) -> Self {
        Self {
            options,
            local_id: None,
            bound: None,
            events: None,
            listener: None,
        }
    }

    /// 实际监听的地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    async fn listen(
        &mut self,
        addr: SocketAddr,
        local_id: String,
        events: EventSink,
    ) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("WebSocket signaling listening on {bound}");

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, local_id, events, stopped));
        self.listener = Some(Listener { stop, task });
        self.bound = Some(bound);
        Ok(bound)
    }

    async fn advertised_address(&self, bound: SocketAddr) -> String {
        let host = match &self.options.advertise_host {
            Some(host) => host.clone(),
            None if bound.ip().is_unspecified() => detect_lan_ip()
                .await
                .map_or_else(|| Ipv4Addr::LOCALHOST.to_string(), |ip| ip.to_string()),
            None => bound.ip().to_string(),
        };
        format!("ws://{host}:{}/", bound.port())
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError> {
        let local_id = uuid::Uuid::new_v4().simple().to_string();
        let bound = self
            .listen(self.options.bind, local_id.clone(), events.clone())
            .await?;
        let address = self.advertised_address(bound).await;

        events
            .send(TransportEvent::SignalingOpened {
                local_id: local_id.clone(),
                address,
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
        let url = format!("{}?peer={}", target.address(), target.peer_id());
        let (handle, outbound) = ChannelHandle::pair(channel);

        debug!("Dialing {url} on {channel}");
        tokio::spawn(async move {
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    let _ = events.send(TransportEvent::ChannelOpened(channel));
                    run_channel(stream, channel, outbound, events).await;
                }
                Err(tungstenite::Error::Http(response))
                    if response.status() == StatusCode::NOT_FOUND =>
                {
                    let _ = events.send(TransportEvent::ChannelError(
                        channel,
                        "peer unavailable".to_string(),
                    ));
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::ChannelError(channel, e.to_string()));
                }
            }
        });

        Ok(handle)
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let (Some(local_id), Some(events)) = (self.local_id.clone(), self.events.clone()) else {
            return Err(TransportError::SignalingNotOpen);
        };
        if self.listener.as_ref().is_some_and(Listener::is_running) {
            return Ok(());
        }
        // 保持端口不变，已发布的描述符才仍然有效
        let addr = self.bound.unwrap_or(self.options.bind);
        self.listen(addr, local_id, events).await?;
        Ok(())
    }

    async fn destroy(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        if let Some(local_id) = self.local_id.take() {
            debug!("WebSocket signaling {local_id} destroyed");
        }
        self.bound = None;
        self.events = None;
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_id: String,
    events: EventSink,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = &mut stopped => {
                debug!("Listener stopped");
                break;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                tokio::spawn(accept_one(stream, remote, local_id.clone(), events.clone()));
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                let _ = events.send(TransportEvent::SignalingError {
                    kind: SignalErrorKind::Network,
                    detail: e.to_string(),
                });
                break;
            }
        }
    }
}

async fn accept_one(stream: TcpStream, remote: SocketAddr, local_id: String, events: EventSink) {
    let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let requested = request.uri().query().and_then(query_peer);
        if requested == Some(local_id.as_str()) {
            Ok(response)
        } else {
            let mut error = ErrorResponse::new(Some("unknown peer".to_string()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            Err(error)
        }
    };

    let stream = match accept_hdr_async(stream, check).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Handshake with {remote} rejected: {e}");
            return;
        }
    };

    let channel = ChannelId::next();
    info!("Incoming connection from {remote} on {channel}");
    let (handle, outbound) = ChannelHandle::pair(channel);
    let _ = events.send(TransportEvent::Incoming(handle));
    let _ = events.send(TransportEvent::ChannelOpened(channel));
    run_channel(stream, channel, outbound, events).await;
}

/// 从查询串中取出 `peer` 参数
fn query_peer(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("peer="))
        .filter(|id| !id.is_empty())
}

/// 驱动一条 WebSocket 连接，直到任一端关闭
async fn run_channel<S>(
    stream: WebSocketStream<S>,
    channel: ChannelId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSink,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                // 写出后才归还额度
                Some(Outbound::Message(message, _permit)) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} on {channel}: {e}", message.kind());
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        let _ = events.send(TransportEvent::ChannelError(channel, e.to_string()));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match Message::decode(&text) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(channel, message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Malformed message on {channel}: {e}"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::ChannelError(channel, e.to_string()));
                    return;
                }
            },
        }
    }

    debug!("Channel {channel} closed");
    let _ = events.send(TransportEvent::ChannelClosed(channel));
}

/// 通过 UDP "连接" 探测出口网卡地址，不发送任何数据
async fn detect_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
