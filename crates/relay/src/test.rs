use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fastpath::OFFLINE_MESSAGE_DATA_ID;
use maps::{Endpoint, EndpointKind, Maps};

use crate::{BedrockRelay, FlowTable, JavaRelay, RelayConfig, RelayContext, RelayMetrics};

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Handshake: length 7, id 0x00, protocol version 760, dummy tail.
const HANDSHAKE: [u8; 7] = [0x07, 0x00, 0xf8, 0x05, 0x01, 0x02, 0x03];

fn test_context(cfg: RelayConfig) -> RelayContext {
    let mut registry = Registry::default();
    RelayContext {
        maps: Arc::new(Maps::new()),
        flows: Arc::new(FlowTable::new()),
        metrics: Arc::new(RelayMetrics::new(&mut registry)),
        cfg,
        flow_token: CancellationToken::new(),
    }
}

fn install_endpoint(ctx: &RelayContext, kind: EndpointKind, front: SocketAddr, origin: SocketAddr) -> Endpoint {
    let endpoint = Endpoint {
        id: Uuid::new_v4(),
        kind,
        front_ip: LOCALHOST,
        front_port: front.port(),
        origin_ip: LOCALHOST,
        origin_port: origin.port(),
        rate_limit: 1000,
        burst_limit: 5000,
        maintenance: false,
        active: true,
    };
    ctx.maps.endpoints.insert(endpoint.front_key(), endpoint.clone()).unwrap();
    endpoint
}

fn ping_payload() -> Vec<u8> {
    let mut payload = vec![0x05];
    payload.extend_from_slice(&OFFLINE_MESSAGE_DATA_ID);
    payload.extend_from_slice(&[0u8; 8]);
    payload
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn java_relay_copies_both_ways() {
    let ctx = test_context(RelayConfig::default());

    // Origin: consume the forwarded handshake plus 32 payload bytes, then
    // answer with 32 bytes of its own.
    let origin = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = vec![0u8; HANDSHAKE.len() + 32];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..HANDSHAKE.len()], &HANDSHAKE);
        stream.write_all(&[0xabu8; 32]).await.unwrap();
        buf
    });

    let relay = JavaRelay::bind((LOCALHOST, 0).into(), ctx.clone()).await.unwrap();
    let front = relay.local_addr().unwrap();
    install_endpoint(&ctx, EndpointKind::Java, front, origin_addr);

    let token = CancellationToken::new();
    tokio::spawn(relay.run(token.clone()));

    let mut client = TcpStream::connect(front).await.unwrap();
    client.write_all(&HANDSHAKE).await.unwrap();
    client.write_all(&[0x11u8; 32]).await.unwrap();

    let mut reply = [0u8; 32];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, [0xabu8; 32]);

    origin_task.await.unwrap();
    drop(client);

    // The flow record is released once both directions close.
    wait_until(|| ctx.flows.is_empty()).await;
    assert_eq!(ctx.metrics.flows_opened.get(), 1);
    assert_eq!(ctx.metrics.bytes_in.get(), 32);
    assert_eq!(ctx.metrics.bytes_out.get(), HANDSHAKE.len() as u64 + 32);
    token.cancel();
}

#[tokio::test]
async fn java_relay_rejects_invalid_opening() {
    let ctx = test_context(RelayConfig::default());

    let origin = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let relay = JavaRelay::bind((LOCALHOST, 0).into(), ctx.clone()).await.unwrap();
    let front = relay.local_addr().unwrap();
    install_endpoint(&ctx, EndpointKind::Java, front, origin_addr);

    let token = CancellationToken::new();
    tokio::spawn(relay.run(token.clone()));

    let mut client = TcpStream::connect(front).await.unwrap();
    client.write_all(b"\xff\xff definitely not minecraft").await.unwrap();

    // The relay closes without ever dialing the origin.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    assert_eq!(ctx.metrics.flows_opened.get(), 0);
    assert!(timeout(Duration::from_millis(200), origin.accept()).await.is_err());
    token.cancel();
}

#[tokio::test]
async fn java_relay_refuses_past_connection_cap() {
    let cfg = RelayConfig { max_connections: 0, ..RelayConfig::default() };
    let ctx = test_context(cfg);

    let relay = JavaRelay::bind((LOCALHOST, 0).into(), ctx.clone()).await.unwrap();
    let front = relay.local_addr().unwrap();
    install_endpoint(&ctx, EndpointKind::Java, front, front);

    let token = CancellationToken::new();
    tokio::spawn(relay.run(token.clone()));

    let mut client = TcpStream::connect(front).await.unwrap();
    let mut buf = [0u8; 1];
    // Prompt close, not a hang.
    let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    wait_until(|| ctx.metrics.flows_refused.get() == 1).await;
    token.cancel();
}

#[tokio::test]
async fn bedrock_relay_challenges_then_proxies() {
    let cfg = RelayConfig { udp_timeout: Duration::from_millis(500), ..RelayConfig::default() };
    let ctx = test_context(cfg);

    // Origin: echo every datagram back.
    let origin = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, peer)) = origin.recv_from(&mut buf).await {
            let _ = origin.send_to(&buf[..n], peer).await;
        }
    });

    let relay = BedrockRelay::bind((LOCALHOST, 0).into(), ctx.clone()).await.unwrap();
    let front = relay.local_addr().unwrap();
    install_endpoint(&ctx, EndpointKind::Bedrock, front, origin_addr);

    let token = CancellationToken::new();
    tokio::spawn(relay.run(token.clone()));

    let client = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    client.connect(front).await.unwrap();

    // First ping lands in the cookie window and is dropped.
    let ping = ping_payload();
    client.send(&ping).await.unwrap();
    let mut buf = vec![0u8; 2048];
    assert!(timeout(Duration::from_millis(150), client.recv(&mut buf)).await.is_err());

    // A retransmit past the round-trip guard is proxied and answered.
    sleep(Duration::from_millis(200)).await;
    client.send(&ping).await.unwrap();
    let n = timeout(Duration::from_secs(5), client.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], &ping[..]);

    // The established session forwards arbitrary payloads without
    // re-challenging.
    client.send(b"gamedata").await.unwrap();
    let n = timeout(Duration::from_secs(5), client.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"gamedata");

    assert_eq!(ctx.metrics.flows_opened.get(), 1);
    assert_eq!(ctx.flows.len(), 1);

    // Idle expiry reclaims the session.
    wait_until(|| ctx.flows.is_empty()).await;
    token.cancel();
}
