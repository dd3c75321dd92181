//! 集成测试 - 两个对等端通过进程内网络互传
//!
//! 驱动任务、会话、发送队列和接收重组一起工作，验证端到端行为。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qrsend_core::peer::{self, PeerEvent, PeerHandle, PeerOptions};
use qrsend_core::transport::memory::MEMORY_ADDRESS;
use qrsend_core::transport::{
    ChannelHandle, ChannelId, EventSink, Outbound, Signaling, TransportError, TransportEvent,
};
use qrsend_core::{
    ChannelCallback, ConnectionDescriptor, ConnectionState, Direction, FileSource, MemoryNetwork,
    Message, Role, SessionConfig, TransferConfig, TransferId, WsOptions, WsSignaling,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn start(
    network: &MemoryNetwork,
    options: PeerOptions,
) -> (PeerHandle, UnboundedReceiver<PeerEvent>) {
    let (callback, events) = ChannelCallback::new();
    let (handle, _task) = peer::spawn(network.signaling(), options, Arc::new(callback));
    (handle, events)
}

/// 等待满足条件的事件，跳过其他事件
async fn wait_for<T>(
    events: &mut UnboundedReceiver<PeerEvent>,
    mut pick: impl FnMut(PeerEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn descriptor(events: &mut UnboundedReceiver<PeerEvent>) -> ConnectionDescriptor {
    wait_for(events, |e| match e {
        PeerEvent::Descriptor(d) => Some(d),
        _ => None,
    })
    .await
}

async fn connected(events: &mut UnboundedReceiver<PeerEvent>) {
    wait_for(events, |e| {
        matches!(e, PeerEvent::State(ConnectionState::Connected)).then_some(())
    })
    .await;
}

/// 启动主机和连接到它的客户端，等待双方连通
async fn pair(
    network: &MemoryNetwork,
) -> (
    (PeerHandle, UnboundedReceiver<PeerEvent>),
    (PeerHandle, UnboundedReceiver<PeerEvent>),
) {
    pair_with(network, PeerOptions::default()).await
}

async fn pair_with(
    network: &MemoryNetwork,
    options: PeerOptions,
) -> (
    (PeerHandle, UnboundedReceiver<PeerEvent>),
    (PeerHandle, UnboundedReceiver<PeerEvent>),
) {
    let (host, mut host_events) = start(network, options.clone());
    let link = descriptor(&mut host_events).await.link();

    let (client, mut client_events) = start(
        network,
        PeerOptions {
            link: Some(link),
            ..options
        },
    );
    connected(&mut host_events).await;
    connected(&mut client_events).await;
    ((host, host_events), (client, client_events))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 小数据块，保证大文件在取消时仍在传输中
fn small_chunks() -> PeerOptions {
    PeerOptions {
        transfer: TransferConfig { chunk_size: 16 },
        ..Default::default()
    }
}

async fn queued_id(events: &mut UnboundedReceiver<PeerEvent>, wanted: &str) -> TransferId {
    wait_for(events, |e| match e {
        PeerEvent::Queued { id, name, .. } if name == wanted => Some(id),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn test_file_arrives_intact() {
    let network = MemoryNetwork::new();
    let ((_host, mut host_events), (client, mut client_events)) = pair(&network).await;

    let data = payload(200_000);
    let source = FileSource::from_bytes("photo.jpg", "image/jpeg", data.clone());
    client.send_file(source).unwrap();

    let (name, size) = wait_for(&mut host_events, |e| match e {
        PeerEvent::Incoming { name, size, .. } => Some((name, size)),
        _ => None,
    })
    .await;
    assert_eq!(name, "photo.jpg");
    assert_eq!(size, 200_000);

    let artifact = wait_for(&mut host_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        _ => None,
    })
    .await;
    assert_eq!(artifact.name, "photo.jpg");
    assert_eq!(artifact.media_type, "image/jpeg");
    assert_eq!(artifact.data, data);

    wait_for(&mut client_events, |e| {
        matches!(e, PeerEvent::Sent(_)).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_files_flow_both_ways() {
    let network = MemoryNetwork::new();
    let ((host, mut host_events), (client, mut client_events)) = pair(&network).await;

    host.send_file(FileSource::from_bytes("a.txt", "text/plain", b"from host".to_vec()))
        .unwrap();
    client
        .send_file(FileSource::from_bytes("b.txt", "text/plain", b"from client".to_vec()))
        .unwrap();

    let at_client = wait_for(&mut client_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        _ => None,
    })
    .await;
    let at_host = wait_for(&mut host_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        _ => None,
    })
    .await;

    assert_eq!(at_client.data, b"from host");
    assert_eq!(at_host.data, b"from client");
}

#[tokio::test]
async fn test_empty_file() {
    let network = MemoryNetwork::new();
    let ((host, _host_events), (_client, mut client_events)) = pair(&network).await;

    host.send_file(FileSource::from_bytes("empty", "text/plain", Vec::new()))
        .unwrap();

    let artifact = wait_for(&mut client_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        _ => None,
    })
    .await;
    assert_eq!(artifact.name, "empty");
    assert!(artifact.data.is_empty());
}

#[tokio::test]
async fn test_chat_and_read_receipt() {
    let network = MemoryNetwork::new();
    let ((_host, mut host_events), (client, mut client_events)) = pair(&network).await;

    let msg_id = client.chat("hello there").unwrap();

    let (received_id, text) = wait_for(&mut host_events, |e| match e {
        PeerEvent::Chat { msg_id, text } => Some((msg_id, text)),
        _ => None,
    })
    .await;
    assert_eq!(received_id, msg_id);
    assert_eq!(text, "hello there");

    let read = wait_for(&mut client_events, |e| match e {
        PeerEvent::ChatRead(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(read, msg_id);
}

#[tokio::test]
async fn test_peer_name_exchanged() {
    let network = MemoryNetwork::new();
    let named = |name: &str| PeerOptions {
        session: SessionConfig {
            display_name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let (_host, mut host_events) = start(&network, named("desk"));
    let link = descriptor(&mut host_events).await.link();
    let (_client, mut client_events) = start(
        &network,
        PeerOptions {
            link: Some(link),
            ..named("phone")
        },
    );

    let seen_by_host = wait_for(&mut host_events, |e| match e {
        PeerEvent::PeerReady(name) => Some(name),
        _ => None,
    })
    .await;
    let seen_by_client = wait_for(&mut client_events, |e| match e {
        PeerEvent::PeerReady(name) => Some(name),
        _ => None,
    })
    .await;
    assert_eq!(seen_by_host.as_deref(), Some("phone"));
    assert_eq!(seen_by_client.as_deref(), Some("desk"));
}

#[tokio::test]
async fn test_cancelled_queued_file_never_sent() {
    let network = MemoryNetwork::new();
    let (host, mut host_events) = start(&network, PeerOptions::default());
    let link = descriptor(&mut host_events).await.link();

    // 没有对端时任务只排队
    host.send_file(FileSource::from_bytes("first", "text/plain", b"1".to_vec()))
        .unwrap();
    host.send_file(FileSource::from_bytes("second", "text/plain", b"2".to_vec()))
        .unwrap();
    let first = wait_for(&mut host_events, |e| match e {
        PeerEvent::Queued { id, name, .. } if name == "first" => Some(id),
        _ => None,
    })
    .await;
    host.cancel_send(first.clone()).unwrap();
    let cancelled = wait_for(&mut host_events, |e| match e {
        PeerEvent::Cancelled {
            direction: Direction::Outbound,
            id,
        } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(cancelled, first);

    let snapshot = host.snapshot().await.unwrap();
    assert_eq!(snapshot.outbound.len(), 1);
    assert_eq!(snapshot.outbound[0].name, "second");

    let (_client, mut client_events) = start(
        &network,
        PeerOptions {
            link: Some(link),
            ..Default::default()
        },
    );
    let artifact = wait_for(&mut client_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        PeerEvent::Incoming { name, .. } => {
            assert_ne!(name, "first");
            None
        }
        _ => None,
    })
    .await;
    assert_eq!(artifact.name, "second");
}

#[tokio::test]
async fn test_host_survives_client_leaving() {
    let network = MemoryNetwork::new();
    let ((host, mut host_events), (client, _client_events)) = pair(&network).await;
    let original = host.snapshot().await.unwrap().descriptor.unwrap();

    client.shutdown().unwrap();

    wait_for(&mut host_events, |e| {
        matches!(e, PeerEvent::State(ConnectionState::AwaitingRemote)).then_some(())
    })
    .await;
    let republished = descriptor(&mut host_events).await;
    assert_eq!(republished, original);

    // 同一个链接可以再次连接
    let (_again, mut again_events) = start(
        &network,
        PeerOptions {
            link: Some(original.link()),
            ..Default::default()
        },
    );
    connected(&mut again_events).await;
    connected(&mut host_events).await;
}

#[tokio::test]
async fn test_client_restarts_as_host_when_host_leaves() {
    let network = MemoryNetwork::new();
    let ((host, _host_events), (client, mut client_events)) = pair(&network).await;
    let host_id = host.snapshot().await.unwrap().descriptor.unwrap();

    host.shutdown().unwrap();

    let fresh = descriptor(&mut client_events).await;
    assert_ne!(fresh.peer_id(), host_id.peer_id());
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.role, qrsend_core::Role::Host);
}

#[tokio::test]
async fn test_unreachable_host_offers_fallback() {
    let network = MemoryNetwork::new();
    let options = PeerOptions {
        session: SessionConfig {
            retry_delay: Duration::from_millis(10),
            attempt_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        link: Some("memory://local/#nobody-home".to_string()),
        ..Default::default()
    };
    let (client, mut events) = start(&network, options);

    let mut retries = Vec::new();
    wait_for(&mut events, |e| match e {
        PeerEvent::Status(status) if status.starts_with("Retry") => {
            retries.push(status);
            None
        }
        PeerEvent::HostFallback => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(retries, vec!["Retry 1", "Retry 2", "Retry 3"]);

    client.become_host().unwrap();
    let published = descriptor(&mut events).await;
    assert!(!published.peer_id().is_empty());
}

#[tokio::test]
async fn test_cancel_active_send_midway() {
    let network = MemoryNetwork::new();
    let ((_host, mut host_events), (client, mut client_events)) =
        pair_with(&network, small_chunks()).await;

    client
        .send_file(FileSource::from_bytes("big.bin", "application/octet-stream", payload(1 << 20)))
        .unwrap();
    client
        .send_file(FileSource::from_bytes("next.txt", "text/plain", b"after".to_vec()))
        .unwrap();
    let big = queued_id(&mut client_events, "big.bin").await;

    // 对端已开始接收后再取消
    wait_for(&mut host_events, |e| match e {
        PeerEvent::Progress {
            direction: Direction::Inbound,
            id,
            ..
        } if id == big => Some(()),
        _ => None,
    })
    .await;
    client.cancel_send(big.clone()).unwrap();

    let cancelled = wait_for(&mut client_events, |e| match e {
        PeerEvent::Cancelled {
            direction: Direction::Outbound,
            id,
        } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(cancelled, big);

    let remote_cancelled = wait_for(&mut host_events, |e| match e {
        PeerEvent::Cancelled {
            direction: Direction::Inbound,
            id,
        } => Some(id),
        PeerEvent::Completed(artifact) => panic!("{} completed after cancel", artifact.name),
        _ => None,
    })
    .await;
    assert_eq!(remote_cancelled, big);

    let artifact = wait_for(&mut host_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        _ => None,
    })
    .await;
    assert_eq!(artifact.name, "next.txt");
    assert_eq!(artifact.data, b"after");
}

#[tokio::test]
async fn test_receiver_cancel_stops_sender() {
    let network = MemoryNetwork::new();
    let ((host, mut host_events), (client, mut client_events)) =
        pair_with(&network, small_chunks()).await;

    client
        .send_file(FileSource::from_bytes("big.bin", "application/octet-stream", payload(1 << 20)))
        .unwrap();
    client
        .send_file(FileSource::from_bytes("next.txt", "text/plain", b"after".to_vec()))
        .unwrap();

    let incoming = wait_for(&mut host_events, |e| match e {
        PeerEvent::Incoming { id, name, .. } if name == "big.bin" => Some(id),
        _ => None,
    })
    .await;
    host.cancel_receive(incoming.clone()).unwrap();

    let local = wait_for(&mut host_events, |e| match e {
        PeerEvent::Cancelled {
            direction: Direction::Inbound,
            id,
        } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(local, incoming);

    let stopped = wait_for(&mut client_events, |e| match e {
        PeerEvent::Cancelled {
            direction: Direction::Outbound,
            id,
        } => Some(id),
        PeerEvent::Sent(id) if id == incoming => panic!("cancelled file reported sent"),
        _ => None,
    })
    .await;
    assert_eq!(stopped, incoming);

    // 发送端提升了下一个任务
    let artifact = wait_for(&mut host_events, |e| match e {
        PeerEvent::Completed(artifact) => Some(artifact),
        _ => None,
    })
    .await;
    assert_eq!(artifact.name, "next.txt");
}

/// 测试直接持有通道写端的信令，入站连接由测试注入
struct ManualSignaling {
    opened: Option<oneshot::Sender<EventSink>>,
}

#[async_trait]
impl Signaling for ManualSignaling {
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError> {
        events
            .send(TransportEvent::SignalingOpened {
                local_id: "manual".to_string(),
                address: MEMORY_ADDRESS.to_string(),
            })
            .map_err(|_| TransportError::ChannelClosed)?;
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(events);
        }
        Ok(())
    }

    fn connect(
        &mut self,
        target: &ConnectionDescriptor,
        _channel: ChannelId,
    ) -> Result<ChannelHandle, TransportError> {
        Err(TransportError::PeerUnavailable(target.peer_id().to_string()))
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn destroy(&mut self) {}
}

async fn next_frame(wire: &mut UnboundedReceiver<Outbound>) -> Outbound {
    timeout(Duration::from_secs(5), wire.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("wire closed")
}

fn frame_kind(frame: &Outbound) -> &'static str {
    match frame {
        Outbound::Message(message, _) => message.kind(),
        Outbound::Close => "close",
    }
}

#[tokio::test]
async fn test_failed_final_chunk_is_not_reported_sent() {
    let (opened_tx, opened_rx) = oneshot::channel();
    let signaling = ManualSignaling {
        opened: Some(opened_tx),
    };
    let options = PeerOptions {
        transfer: TransferConfig { chunk_size: 4 },
        ..Default::default()
    };
    let (callback, mut events) = ChannelCallback::new();
    let (host, _task) = peer::spawn(signaling, options, Arc::new(callback));
    let sink = opened_rx.await.unwrap();
    descriptor(&mut events).await;

    // 写入额度为 1: 第一块未被取走前不会读取第二块
    let channel = ChannelId::next();
    let (handle, mut wire) = ChannelHandle::with_window(channel, 1);
    sink.send(TransportEvent::Incoming(handle)).unwrap();
    sink.send(TransportEvent::ChannelOpened(channel)).unwrap();
    connected(&mut events).await;
    assert_eq!(frame_kind(&next_frame(&mut wire).await), "ready");

    host.send_file(FileSource::from_bytes("eight.bin", "application/octet-stream", payload(8)))
        .unwrap();
    let id = queued_id(&mut events, "eight.bin").await;
    assert_eq!(frame_kind(&next_frame(&mut wire).await), "metadata");
    let first_chunk = next_frame(&mut wire).await;
    assert!(matches!(
        &first_chunk,
        Outbound::Message(Message::Chunk { chunk, .. }, Some(_)) if chunk.len() == 4
    ));

    // 通道写端消失后才归还额度，最后一块和 end 都写不出去
    drop(wire);
    drop(first_chunk);

    let dropped = wait_for(&mut events, |e| match e {
        PeerEvent::Sent(_) => panic!("file reported sent although its last chunk never left"),
        PeerEvent::Progress {
            direction: Direction::Outbound,
            progress,
            ..
        } => {
            assert!(progress.percent < 100);
            None
        }
        PeerEvent::Cancelled {
            direction: Direction::Outbound,
            id,
        } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(dropped, id);

    // 写入失败按连接丢失处理，主机回到等待状态
    let snapshot = host.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::AwaitingRemote);
    assert!(snapshot.outbound.is_empty());
}

fn loopback_ws(port: u16) -> WsSignaling {
    WsSignaling::new(WsOptions {
        bind: SocketAddr::from(([127, 0, 0, 1], port)),
        advertise_host: Some("127.0.0.1".to_string()),
    })
}

#[tokio::test]
async fn test_ws_client_restarts_as_host_on_same_port() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let (host_callback, mut host_events) = ChannelCallback::new();
    let (host, _host_task) = peer::spawn(
        loopback_ws(0),
        PeerOptions::default(),
        Arc::new(host_callback),
    );
    let link = descriptor(&mut host_events).await.link();

    let (client_callback, mut client_events) = ChannelCallback::new();
    let (client, _client_task) = peer::spawn(
        loopback_ws(port),
        PeerOptions {
            link: Some(link),
            ..Default::default()
        },
        Arc::new(client_callback),
    );
    connected(&mut client_events).await;

    host.shutdown().unwrap();

    // 重启后在原端口重新监听并发布新的链接
    let fresh = descriptor(&mut client_events).await;
    assert_eq!(fresh.address(), format!("ws://127.0.0.1:{port}/"));
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Role::Host);
    assert_eq!(snapshot.state, ConnectionState::AwaitingRemote);
}
