//! Connection-oriented relay for Java endpoints.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use fastpath::{classify_flow, PacketView, Verdict};
use maps::Protocol;
use util::time::now_ms;

use crate::{FlowRecord, RelayContext};

/// Accept loop for one Java endpoint. Flows run as independent tasks so a
/// stalled copy can never starve accept.
pub struct JavaRelay {
    listener: TcpListener,
    ctx: RelayContext,
}

impl JavaRelay {
    pub async fn bind(addr: SocketAddr, ctx: RelayContext) -> anyhow::Result<JavaRelay> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("unable to bind Java relay at {addr}"))?;
        Ok(JavaRelay { listener, ctx })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("Java relay has no local address")
    }

    pub async fn run(self, token: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Java accept failed: {e}");
                        continue;
                    }
                }
            };

            // Back-pressure: refuse promptly, do not hang the client.
            if self.ctx.flows.len() >= self.ctx.cfg.max_connections {
                self.ctx.metrics.flows_refused.inc();
                drop(stream);
                continue;
            }

            let ctx = self.ctx.clone();
            // Flows outlive the accept loop until the grace window closes.
            let flow_token = self.ctx.flow_token.child_token();
            tokio::spawn(async move {
                if let Err(e) = run_flow(stream, peer, ctx, flow_token).await {
                    tracing::debug!("Java flow from {peer} ended: {e:#}");
                }
            });
        }
    }
}

async fn run_flow(
    mut client: TcpStream,
    peer: SocketAddr,
    ctx: RelayContext,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let local = client.local_addr()?;
    let (IpAddr::V4(peer_ip), IpAddr::V4(local_ip)) = (peer.ip(), local.ip()) else {
        anyhow::bail!("non-IPv4 peer");
    };
    let endpoint_key = maps::front_key(u32::from(local_ip), local.port(), Protocol::Tcp);

    // The opening bytes decide admission.
    let mut first = vec![0u8; ctx.cfg.buffer_size];
    let n = timeout(ctx.cfg.tcp_timeout, client.read(&mut first))
        .await
        .context("timed out waiting for the opening payload")??;
    if n == 0 {
        return Ok(());
    }

    let view = PacketView {
        src_ip: u32::from(peer_ip),
        dst_ip: u32::from(local_ip),
        src_port: peer.port(),
        dst_port: local.port(),
        protocol: Protocol::Tcp,
        payload: &first[..n],
    };
    if classify_flow(&ctx.maps, now_ms(), &view) != Verdict::Redirect {
        return Ok(());
    }

    let Some(endpoint) = ctx.maps.endpoints.lookup(&endpoint_key) else {
        anyhow::bail!("endpoint disappeared before dial");
    };

    let origin = SocketAddr::new(IpAddr::V4(endpoint.origin_ip), endpoint.origin_port);
    let server = match timeout(ctx.cfg.dial_timeout, TcpStream::connect(origin)).await {
        Ok(Ok(server)) => server,
        Ok(Err(e)) => {
            ctx.metrics.origin_dial_failures.inc();
            anyhow::bail!("origin dial failed: {e}");
        }
        Err(_) => {
            ctx.metrics.origin_dial_failures.inc();
            anyhow::bail!("origin dial timed out after {:?}", ctx.cfg.dial_timeout);
        }
    };

    let flow = ctx.flows.allocate(endpoint.id, peer);
    flow.set_server(origin);
    ctx.metrics.flows_opened.inc();
    ctx.metrics.flows_active.inc();
    tracing::debug!("Java flow {} {peer} -> {origin}", flow.id);

    let result = copy_bidirectional(client, server, &first[..n], &flow, &ctx, token).await;

    ctx.flows.release(flow.id);
    ctx.metrics.flows_active.dec();
    ctx.metrics.bytes_in.inc_by(flow.bytes_in());
    ctx.metrics.bytes_out.inc_by(flow.bytes_out());
    result
}

/// Runs both copy directions until either side ends, then closes both.
async fn copy_bidirectional(
    client: TcpStream,
    server: TcpStream,
    opening: &[u8],
    flow: &Arc<FlowRecord>,
    ctx: &RelayContext,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();

    server_write.write_all(opening).await.context("forwarding the opening payload")?;
    flow.add_out(opening.len());
    flow.touch();

    let upstream = async {
        let mut buf = vec![0u8; ctx.cfg.buffer_size];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            server_write.write_all(&buf[..n]).await?;
            flow.add_out(n);
            flow.touch();
        }
        anyhow::Ok(())
    };
    let downstream = async {
        let mut buf = vec![0u8; ctx.cfg.buffer_size];
        loop {
            let n = server_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
            flow.add_in(n);
            flow.touch();
        }
        anyhow::Ok(())
    };

    // Either direction finishing tears the flow down; dropping the halves
    // closes both sockets.
    tokio::select! {
        r = upstream => r?,
        r = downstream => r?,
        _ = token.cancelled() => (),
    }
    Ok(())
}
