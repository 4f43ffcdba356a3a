//! Session-keyed datagram relay for Bedrock endpoints.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use fastpath::{classify_flow, PacketView, Verdict};
use maps::Protocol;
use util::time::now_ms;

use crate::{FlowRecord, RelayContext};

/// Cadence of the idle-session sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on one upstream read so the reader can notice cancellation
/// and idleness.
const UPSTREAM_READ_DEADLINE: Duration = Duration::from_secs(1);

struct Session {
    flow: Arc<FlowRecord>,
    upstream: Arc<UdpSocket>,
    token: CancellationToken,
}

/// Datagram relay for one Bedrock endpoint. All client traffic shares the
/// single front socket; each session owns an ephemeral upstream socket
/// connected to the origin.
pub struct BedrockRelay {
    socket: Arc<UdpSocket>,
    ctx: RelayContext,
    sessions: Arc<DashMap<SocketAddr, Arc<Session>>>,
}

impl BedrockRelay {
    pub async fn bind(addr: SocketAddr, ctx: RelayContext) -> anyhow::Result<BedrockRelay> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("unable to bind Bedrock relay at {addr}"))?;
        Ok(BedrockRelay {
            socket: Arc::new(socket),
            ctx,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("Bedrock relay has no local address")
    }

    pub async fn run(self, token: CancellationToken) {
        let sweeper = {
            let sessions = Arc::clone(&self.sessions);
            let ctx = self.ctx.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => (),
                    }
                    let idle_limit = ctx.cfg.udp_timeout.as_millis() as u64;
                    let expired: Vec<SocketAddr> = sessions
                        .iter()
                        .filter(|s| s.flow.idle_ms() >= idle_limit)
                        .map(|s| *s.key())
                        .collect();
                    for client in expired {
                        if let Some((_, session)) = sessions.remove(&client) {
                            close_session(&ctx, &session);
                        }
                    }
                }
            })
        };

        let mut buf = vec![0u8; self.ctx.cfg.buffer_size];
        loop {
            let (n, peer) = tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Bedrock receive failed: {e}");
                        continue;
                    }
                }
            };

            let IpAddr::V4(peer_ip) = peer.ip() else { continue };
            let Ok(local) = self.socket.local_addr() else { continue };
            let IpAddr::V4(local_ip) = local.ip() else { continue };

            let view = PacketView {
                src_ip: u32::from(peer_ip),
                dst_ip: u32::from(local_ip),
                src_port: peer.port(),
                dst_port: local.port(),
                protocol: Protocol::Udp,
                payload: &buf[..n],
            };
            if classify_flow(&self.ctx.maps, now_ms(), &view) != Verdict::Redirect {
                continue;
            }

            // Clone the session out before any await; holding a table guard
            // across I/O would block the sweeper.
            let session = self.sessions.get(&peer).map(|s| Arc::clone(s.value()));
            let session = match session {
                Some(session) => session,
                None => match self.open_session(peer, token.child_token()).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::debug!("refusing Bedrock session for {peer}: {e:#}");
                        continue;
                    }
                },
            };

            match session.upstream.send(&buf[..n]).await {
                Ok(sent) => {
                    session.flow.add_out(sent);
                    session.flow.touch();
                }
                Err(e) => {
                    tracing::debug!("upstream send for {peer} failed: {e}");
                    self.sessions.remove(&peer);
                    close_session(&self.ctx, &session);
                }
            }
        }

        // Shutdown: drop every session, then stop the sweeper.
        for entry in self.sessions.iter() {
            close_session(&self.ctx, entry.value());
        }
        self.sessions.clear();
        sweeper.abort();
    }

    async fn open_session(&self, peer: SocketAddr, token: CancellationToken) -> anyhow::Result<Arc<Session>> {
        if self.ctx.flows.len() >= self.ctx.cfg.max_connections {
            self.ctx.metrics.flows_refused.inc();
            anyhow::bail!("connection cap reached");
        }
        let local = self.socket.local_addr()?;
        let IpAddr::V4(local_ip) = local.ip() else {
            anyhow::bail!("non-IPv4 front address");
        };
        let endpoint_key = maps::front_key(u32::from(local_ip), local.port(), Protocol::Udp);
        let Some(endpoint) = self.ctx.maps.endpoints.lookup(&endpoint_key) else {
            anyhow::bail!("endpoint disappeared");
        };
        let origin = SocketAddr::new(IpAddr::V4(endpoint.origin_ip), endpoint.origin_port);

        let upstream = UdpSocket::bind("0.0.0.0:0").await.context("binding upstream socket")?;
        upstream.connect(origin).await.map_err(|e| {
            self.ctx.metrics.origin_dial_failures.inc();
            anyhow::anyhow!("origin connect failed: {e}")
        })?;
        let upstream = Arc::new(upstream);

        let flow = self.ctx.flows.allocate(endpoint.id, peer);
        flow.set_server(origin);
        self.ctx.metrics.flows_opened.inc();
        self.ctx.metrics.flows_active.inc();
        tracing::debug!("Bedrock session {} {peer} -> {origin}", flow.id);

        let session = Arc::new(Session { flow, upstream, token });
        self.sessions.insert(peer, Arc::clone(&session));

        // Responses travel back through the shared front socket.
        {
            let session = Arc::clone(&session);
            let front = Arc::clone(&self.socket);
            let buffer_size = self.ctx.cfg.buffer_size;
            tokio::spawn(async move {
                let mut buf = vec![0u8; buffer_size];
                loop {
                    let received = tokio::select! {
                        _ = session.token.cancelled() => break,
                        received = timeout(UPSTREAM_READ_DEADLINE, session.upstream.recv(&mut buf)) => received,
                    };
                    match received {
                        Ok(Ok(n)) => {
                            if front.send_to(&buf[..n], session.flow.client).await.is_err() {
                                break;
                            }
                            session.flow.add_in(n);
                            session.flow.touch();
                        }
                        Ok(Err(e)) => {
                            tracing::debug!("upstream read failed: {e}");
                            break;
                        }
                        // Deadline: loop around and re-check cancellation.
                        Err(_) => (),
                    }
                }
            });
        }

        Ok(session)
    }
}

fn close_session(ctx: &RelayContext, session: &Session) {
    session.token.cancel();
    ctx.flows.release(session.flow.id);
    ctx.metrics.flows_active.dec();
    ctx.metrics.bytes_in.inc_by(session.flow.bytes_in());
    ctx.metrics.bytes_out.inc_by(session.flow.bytes_out());
}
