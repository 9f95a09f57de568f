//! Echo client: synchronous connect/exchange/close session.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};

use crate::cm::{CmError, CmEventKind, CmId, EventChannel};
use crate::msg;
use crate::rdma::cq::Cq;
use crate::rdma::mr::RegisteredBuf;
use crate::rdma::pd::Pd;
use crate::utils::token::StopToken;

/// Bound on address resolution and its confirmation event.
const RESOLVE_ADDR_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound on route resolution and its confirmation event.
const RESOLVE_ROUTE_TIMEOUT: Duration = Duration::from_millis(1000);

/// A connected echo session.
///
/// Every exchange is fully synchronous: one send or receive is posted,
/// and the call returns only once the adapter confirmed its completion.
/// Field order is teardown order: buffers deregister first, then the
/// identifier destroys the queue pair and itself, then completion queue
/// and channel, the protection domain, and finally the event channel.
pub struct EchoClient {
    outbound: RegisteredBuf,
    inbound: RegisteredBuf,
    id: CmId,
    cq: Cq,
    _pd: Pd,
    chan: EventChannel,
    /// Never set; client waits are not cancellable.
    stop: StopToken,
}

impl EchoClient {
    /// Resolve `host:port`, negotiate a reliable connection and register
    /// the message buffers.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let chan = EventChannel::new().context("failed to create event channel")?;
        let mut id = CmId::new(&chan).context("failed to create CM ID")?;

        // Try every name-resolution candidate; first success wins.
        let candidates = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {host}:{port}"))?;
        let resolving = candidates
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .any(|dst| {
                id.resolve_addr(dst, RESOLVE_ADDR_TIMEOUT.as_millis() as i32)
                    .is_ok()
            });
        if !resolving {
            return Err(CmError::AddrUnresolvable).context(format!("cannot reach {host}:{port}"));
        }
        chan.expect_event(
            CmEventKind::AddrResolved,
            Some(RESOLVE_ADDR_TIMEOUT),
            "address resolution",
        )
        .context("address resolution did not complete")?;

        id.resolve_route(RESOLVE_ROUTE_TIMEOUT.as_millis() as i32)
            .context("failed to resolve route")?;
        chan.expect_event(
            CmEventKind::RouteResolved,
            Some(RESOLVE_ROUTE_TIMEOUT),
            "route resolution",
        )
        .context("route resolution did not complete")?;

        // The device context is known only now that the route is
        // resolved; everything below is scoped to it.
        let ctx = id
            .verbs()
            .ok_or_else(|| anyhow!("no device context after route resolution"))?;
        let pd = Pd::alloc(&ctx).context("failed to alloc PD")?;
        let cq = Cq::new(&ctx, Cq::DEFAULT_CQ_DEPTH).context("failed to create CQ")?;
        id.create_qp(&pd, &cq).context("failed to create QP")?;

        id.connect().context("failed to connect")?;
        chan.expect_event(CmEventKind::Established, None, "connection establishment")
            .context("connection was not established")?;

        // Buffers are registered only once the connection stands.
        let outbound =
            RegisteredBuf::new(&pd, msg::BUF_SIZE).context("failed to register send MR")?;
        let inbound =
            RegisteredBuf::new(&pd, msg::BUF_SIZE).context("failed to register recv MR")?;

        Ok(Self {
            outbound,
            inbound,
            id,
            cq,
            _pd: pd,
            chan,
            stop: StopToken::new(),
        })
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        msg::write_payload(&mut self.outbound, bytes)?;
        self.id
            .post_send(&self.outbound)
            .context("failed to post send")?;
        let wc = self
            .cq
            .next_completion(&self.stop)
            .context("failed to wait for send completion")?;
        wc.ok().context("send failed")?;
        Ok(())
    }

    /// Send one message and block until the adapter confirms the send.
    ///
    /// The payload must fit the fixed buffer with its terminator, i.e.
    /// be shorter than [`msg::BUF_SIZE`] bytes; longer payloads are
    /// rejected, not truncated.
    pub fn post_send(&mut self, message: &str) -> Result<()> {
        self.send_bytes(message.as_bytes())
    }

    /// Post one receive, block until it completes, and return the
    /// payload.
    pub fn post_recv(&mut self) -> Result<String> {
        self.inbound.clear();
        self.id
            .post_recv(&mut self.inbound)
            .context("failed to post recv")?;
        let wc = self
            .cq
            .next_completion(&self.stop)
            .context("failed to wait for recv completion")?;
        wc.ok().context("recv failed")?;
        Ok(String::from_utf8_lossy(msg::payload(&self.inbound)).into_owned())
    }

    /// Announce termination with the sentinel, disconnect, and wait for
    /// the server's confirmation.
    pub fn close(mut self) -> Result<()> {
        self.send_bytes(msg::SENTINEL)?;
        self.id.disconnect().context("failed to disconnect")?;
        self.chan
            .expect_event(CmEventKind::Disconnected, None, "disconnect confirmation")
            .context("disconnect was not confirmed")?;
        log::info!("client closed");
        Ok(())
    }
}
