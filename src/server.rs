//! Echo server: listen state machine and per-connection workers.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::ptr::NonNull;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context as _, Result};

use crate::cm::{self, CmEventKind, CmId, EventChannel};
use crate::msg;
use crate::rdma::cq::{Cq, CqError};
use crate::rdma::device::{DeviceContext, DeviceList};
use crate::rdma::mr::RegisteredBuf;
use crate::rdma::pd::Pd;
use crate::rdma::wc::WcOpcode;
use crate::utils::token::StopToken;

/// Backlog of pending connection requests on the listening identifier.
const LISTEN_BACKLOG: i32 = 1;

/// Handle to a running worker, owned by the listen loop.
///
/// The thread returns the worker's resources on exit, so they are torn
/// down only after a join: the loop may safely touch the connection's
/// raw identifier up to that point.
struct WorkerHandle<T> {
    /// The raw `rdma_cm_id` pointer value of the connection, used to
    /// match disconnect events against their worker.
    key: usize,
    stop: StopToken,
    thread: JoinHandle<T>,
}

/// Single-writer collection of active workers.
///
/// Only the connection-management loop thread ever touches this; worker
/// threads never see it.
struct WorkerRegistry<T> {
    workers: Vec<WorkerHandle<T>>,
}

impl<T> WorkerRegistry<T> {
    fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.workers.len()
    }

    fn insert(&mut self, handle: WorkerHandle<T>) {
        self.workers.push(handle);
    }

    /// Remove the worker owning the given connection, if any.
    fn remove(&mut self, key: usize) -> Option<WorkerHandle<T>> {
        let pos = self.workers.iter().position(|w| w.key == key)?;
        Some(self.workers.remove(pos))
    }

    /// Signal every worker to stop and join them all, releasing their
    /// resources. Returns the number of worker threads that could not be
    /// joined back because they panicked.
    fn stop_and_join_all(&mut self) -> usize {
        for worker in &self.workers {
            worker.stop.stop();
        }
        let mut failed = 0;
        for worker in self.workers.drain(..) {
            if worker.thread.join().is_err() {
                log::error!("worker thread panicked");
                failed += 1;
            }
        }
        failed
    }
}

/// The data-plane loop of one accepted connection.
///
/// Field order is teardown order: buffers deregister first, then the
/// identifier destroys the queue pair and itself, then the completion
/// queue and its channel go; the protection domain is released last,
/// once no clone held here remains.
struct Worker {
    inbound: RegisteredBuf,
    outbound: RegisteredBuf,
    id: CmId,
    cq: Cq,
    stop: StopToken,
    recv_posted: bool,
}

impl Worker {
    fn run(&mut self) {
        if let Err(err) = self.serve() {
            log::warn!("worker exited with error: {err:#}");
        }
    }

    /// Service the connection until the sentinel is seen, the peer
    /// disconnects, or a stop is requested.
    fn serve(&mut self) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                break;
            }

            // The receive queue is one deep; re-post only after the
            // previous receive completed.
            if !self.recv_posted {
                self.id
                    .post_recv(&mut self.inbound)
                    .context("failed to post recv")?;
                self.recv_posted = true;
            }

            let wc = match self.cq.next_completion(&self.stop) {
                Ok(wc) => wc,
                Err(CqError::Stopped) => break,
                Err(err) => return Err(err).context("failed to wait for a completion"),
            };
            if let Err(status) = wc.ok() {
                if status.is_flush() {
                    // The peer disconnected with our receive still
                    // posted; the connection is going down.
                    log::debug!("receive flushed, ending worker");
                    break;
                }
                return Err(anyhow!(status)).context("work request failed");
            }

            match wc.opcode() {
                WcOpcode::Recv => {
                    self.recv_posted = false;
                    if msg::is_sentinel(&self.inbound) {
                        self.stop.stop();
                    }
                    msg::fill_reversed(&self.inbound, &mut self.outbound);
                    self.inbound.clear();
                    self.id
                        .post_send(&self.outbound)
                        .context("failed to post send")?;
                }
                // Send completions (and anything else) carry no work.
                _ => {}
            }
        }
        Ok(())
    }
}

/// One-server-many-clients echo service.
///
/// [`listen`](EchoServer::listen) runs the connection-management event
/// loop on the calling thread and spawns one worker thread per accepted
/// connection. Another thread may request shutdown through the token
/// from [`stop_token`](EchoServer::stop_token); `listen` then joins all
/// workers before returning.
pub struct EchoServer {
    stop: StopToken,
    /// Workers left unreclaimed by the last `listen` call.
    unreclaimed_workers: usize,
}

impl Default for EchoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoServer {
    pub fn new() -> Self {
        Self {
            stop: StopToken::new(),
            unreclaimed_workers: 0,
        }
    }

    /// The token that stops the listen loop. Exit is not immediate: the
    /// loop finishes its current bounded wait first.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Number of worker threads not yet joined back. Zero after a
    /// completed [`listen`](EchoServer::listen).
    pub fn worker_count(&self) -> usize {
        self.unreclaimed_workers
    }

    /// Bind `ip:port` and serve connections until stopped.
    pub fn listen(&mut self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let chan = EventChannel::new().context("failed to create event channel")?;
        let listen_id = CmId::new(&chan).context("failed to create listen CM ID")?;
        listen_id
            .bind(SocketAddrV4::new(ip, port))
            .with_context(|| format!("failed to bind {ip}:{port}"))?;
        listen_id
            .listen(LISTEN_BACKLOG)
            .context("failed to begin RDMA listen")?;

        // Workers are scoped to the first available device context, not
        // to the listening identifier.
        let devices = DeviceList::available().context("failed to enumerate RDMA devices")?;
        let ctx = devices
            .first()
            .ok_or_else(|| anyhow!("no RDMA device available"))?;
        let pd = Pd::alloc(&ctx).context("failed to alloc PD")?;

        log::info!("ready to listen on {ip}:{port}");

        let mut registry = WorkerRegistry::new();
        while !self.stop.is_stopped() {
            let event = match chan
                .next_event_cancellable(&self.stop)
                .context("failed to get CM event")?
            {
                Some(event) => event,
                None => break,
            };

            match event.kind() {
                CmEventKind::ConnectRequest => {
                    let raw_id = event.id();
                    event.ack();
                    // Best effort: a connection we cannot provision is
                    // dropped without taking the listen loop down.
                    if let Err(err) = accept_connection(raw_id, &chan, &ctx, &pd, &mut registry) {
                        log::warn!("failed to provision connection: {err:#}");
                    }
                }
                CmEventKind::Disconnected => {
                    let raw_id = event.id();
                    event.ack();
                    reap_disconnected(&mut registry, raw_id);
                }
                other => {
                    log::debug!("ignoring CM event {other:?}");
                    event.ack();
                }
            }
        }

        self.unreclaimed_workers = registry.stop_and_join_all();
        log::info!("listen loop stopped");
        Ok(())
    }
}

/// Handle a disconnect notification: signal the matching worker,
/// disconnect its identifier and reclaim the thread.
fn reap_disconnected(registry: &mut WorkerRegistry<Worker>, raw_id: *mut rdma_sys::rdma_cm_id) {
    let Some(handle) = registry.remove(raw_id as usize) else {
        return;
    };
    handle.stop.stop();
    // The worker still owns the identifier; it is destroyed only once
    // the join below returns its resources.
    if let Err(err) = unsafe { cm::id::disconnect_raw(raw_id) } {
        log::debug!("disconnect after peer hangup failed: {err}");
    }
    if handle.thread.join().is_err() {
        log::error!("worker thread panicked");
    }
}

/// Stand up the queue pair, completion machinery and buffers for an
/// inbound connection request, start its worker and accept.
fn accept_connection(
    raw_id: *mut rdma_sys::rdma_cm_id,
    chan: &EventChannel,
    ctx: &DeviceContext,
    pd: &Pd,
    registry: &mut WorkerRegistry<Worker>,
) -> Result<()> {
    let raw_id = NonNull::new(raw_id).ok_or_else(|| anyhow!("connect request without an ID"))?;
    // SAFETY: the connect-request event handed this identifier over.
    let mut id = unsafe { CmId::from_request(raw_id, chan) };

    let cq = Cq::new(ctx, Cq::DEFAULT_CQ_DEPTH).context("failed to create CQ")?;
    id.create_qp(pd, &cq).context("failed to create QP")?;
    let inbound = RegisteredBuf::new(pd, msg::BUF_SIZE).context("failed to register recv MR")?;
    let outbound = RegisteredBuf::new(pd, msg::BUF_SIZE).context("failed to register send MR")?;

    let stop = StopToken::new();
    let key = raw_id.as_ptr() as usize;
    let mut worker = Worker {
        inbound,
        outbound,
        id,
        cq,
        stop: stop.clone(),
        recv_posted: false,
    };

    // The worker posts its first receive before we accept, so the
    // client's first send always finds a posted buffer. The thread
    // hands the worker back on exit; resources are dropped at join.
    let thread = thread::Builder::new()
        .name(format!("echo-worker-{key:x}"))
        .spawn(move || {
            worker.run();
            worker
        })
        .context("failed to spawn worker thread")?;

    // SAFETY: the worker owns the identifier but cannot release it
    // before its thread is joined.
    if let Err(err) = unsafe { cm::id::accept_raw(raw_id.as_ptr()) } {
        stop.stop();
        let _ = thread.join();
        return Err(err).context("failed to accept connection");
    }

    registry.insert(WorkerHandle { key, stop, thread });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dummy_handle(key: usize) -> WorkerHandle<()> {
        let stop = StopToken::new();
        let thread = {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.is_stopped() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        WorkerHandle { key, stop, thread }
    }

    #[test]
    fn registry_removes_by_key() {
        let mut registry = WorkerRegistry::new();
        registry.insert(dummy_handle(0x10));
        registry.insert(dummy_handle(0x20));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(0x30).is_none());
        let handle = registry.remove(0x10).unwrap();
        assert_eq!(handle.key, 0x10);
        assert_eq!(registry.len(), 1);

        handle.stop.stop();
        handle.thread.join().unwrap();
        assert_eq!(registry.stop_and_join_all(), 0);
    }

    #[test]
    fn registry_joins_back_to_zero() {
        let mut registry = WorkerRegistry::new();
        for key in 0..4 {
            registry.insert(dummy_handle(key));
        }
        assert_eq!(registry.stop_and_join_all(), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn panicked_worker_counts_as_unreclaimed() {
        let mut registry = WorkerRegistry::new();
        registry.insert(dummy_handle(1));
        registry.insert(WorkerHandle {
            key: 2,
            stop: StopToken::new(),
            thread: thread::spawn(|| panic!("worker blew up")),
        });
        assert_eq!(registry.stop_and_join_all(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn fresh_server_has_no_workers() {
        let server = EchoServer::new();
        assert_eq!(server.worker_count(), 0);
        assert!(!server.stop_token().is_stopped());
    }
}
