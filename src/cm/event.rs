//! Connection-management event channel and events.

use std::io::{self, Error as IoError};
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

use rdma_sys::*;

use super::CmError;
use crate::utils::interop::{from_cm_ret, poll_readable};
use crate::utils::token::{StopToken, CANCEL_POLL_SLICE};

/// Kind of a connection-management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    /// Any event kind the echo protocol has no use for.
    Other(u32),
}

impl CmEventKind {
    fn from_raw(raw: u32) -> Self {
        use rdma_cm_event_type::*;
        match raw {
            x if x == RDMA_CM_EVENT_ADDR_RESOLVED as u32 => Self::AddrResolved,
            x if x == RDMA_CM_EVENT_ADDR_ERROR as u32 => Self::AddrError,
            x if x == RDMA_CM_EVENT_ROUTE_RESOLVED as u32 => Self::RouteResolved,
            x if x == RDMA_CM_EVENT_ROUTE_ERROR as u32 => Self::RouteError,
            x if x == RDMA_CM_EVENT_CONNECT_REQUEST as u32 => Self::ConnectRequest,
            x if x == RDMA_CM_EVENT_CONNECT_RESPONSE as u32 => Self::ConnectResponse,
            x if x == RDMA_CM_EVENT_CONNECT_ERROR as u32 => Self::ConnectError,
            x if x == RDMA_CM_EVENT_UNREACHABLE as u32 => Self::Unreachable,
            x if x == RDMA_CM_EVENT_REJECTED as u32 => Self::Rejected,
            x if x == RDMA_CM_EVENT_ESTABLISHED as u32 => Self::Established,
            x if x == RDMA_CM_EVENT_DISCONNECTED as u32 => Self::Disconnected,
            x if x == RDMA_CM_EVENT_DEVICE_REMOVAL as u32 => Self::DeviceRemoval,
            x => Self::Other(x),
        }
    }
}

/// A single connection-management event.
///
/// The event is acknowledged back to `librdmacm` when this value drops;
/// hold it no longer than needed, since an unacknowledged connection
/// event stalls the identifier it belongs to.
pub struct CmEvent {
    event: NonNull<rdma_cm_event>,
}

unsafe impl Send for CmEvent {}

impl CmEvent {
    /// Get the kind of this event.
    pub fn kind(&self) -> CmEventKind {
        // SAFETY: the pointer is valid until acknowledged on drop.
        let raw = unsafe { (*self.event.as_ptr()).event };
        CmEventKind::from_raw(raw as u32)
    }

    /// Get the identifier this event concerns. For a connect request,
    /// this is the freshly created identifier of the new connection.
    pub(crate) fn id(&self) -> *mut rdma_cm_id {
        // SAFETY: the pointer is valid until acknowledged on drop.
        unsafe { (*self.event.as_ptr()).id }
    }

    /// Acknowledge the event.
    pub fn ack(self) {}
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        // SAFETY: FFI; each event is acknowledged exactly once.
        let ret = unsafe { rdma_ack_cm_event(self.event.as_ptr()) };
        if ret != 0 {
            // Never panic in a destructor over a lost ack.
            log::warn!("failed to ack CM event: {}", IoError::last_os_error());
        }
    }
}

/// Ownership holder of the event channel.
struct EventChannelInner {
    chan: NonNull<rdma_event_channel>,
}

unsafe impl Send for EventChannelInner {}
unsafe impl Sync for EventChannelInner {}

impl Drop for EventChannelInner {
    fn drop(&mut self) {
        // SAFETY: call only once; every identifier created on this
        // channel holds a clone, so none outlives it.
        unsafe { rdma_destroy_event_channel(self.chan.as_ptr()) };
    }
}

/// Asynchronous conduit of connection-management events.
///
/// One per role. Identifiers created on the channel keep it alive via a
/// clone, so the channel is destroyed last, after every identifier.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<EventChannelInner>,
}

impl EventChannel {
    /// Create a new event channel.
    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let chan = unsafe { rdma_create_event_channel() };
        let chan = NonNull::new(chan).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            inner: Arc::new(EventChannelInner { chan }),
        })
    }

    /// Get the underlying `rdma_event_channel` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut rdma_event_channel {
        self.inner.chan.as_ptr()
    }

    #[inline]
    fn fd(&self) -> c_int {
        // SAFETY: the pointer is valid as long as `self` is alive.
        unsafe { (*self.as_raw()).fd }
    }

    fn get_event(&self) -> Result<CmEvent, CmError> {
        let mut event = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_get_cm_event(self.as_raw(), &mut event) };
        from_cm_ret(ret)?;
        // A zero return guarantees a valid event pointer.
        let event = NonNull::new(event).ok_or_else(IoError::last_os_error)?;
        Ok(CmEvent { event })
    }

    /// Block indefinitely for the next event.
    pub fn next_event(&self) -> Result<CmEvent, CmError> {
        self.get_event()
    }

    /// Wait for the next event, failing with [`CmError::Timeout`] if
    /// none arrives within the bound.
    pub fn next_event_timeout(
        &self,
        timeout: Duration,
        what: &'static str,
    ) -> Result<CmEvent, CmError> {
        if !poll_readable(self.fd(), Some(timeout))? {
            return Err(CmError::Timeout(what));
        }
        self.get_event()
    }

    /// Wait for the next event, returning `Ok(None)` once the stop token
    /// is set. Cancellation latency is bounded by one poll slice.
    pub fn next_event_cancellable(&self, stop: &StopToken) -> Result<Option<CmEvent>, CmError> {
        loop {
            if stop.is_stopped() {
                return Ok(None);
            }
            if poll_readable(self.fd(), Some(CANCEL_POLL_SLICE))? {
                return self.get_event().map(Some);
            }
        }
    }

    /// Wait for an event of the given kind and acknowledge it.
    ///
    /// Any other kind fails with [`CmError::UnexpectedEvent`]; the CM
    /// handshake this crate drives is strictly sequential, so an
    /// out-of-order event is a protocol error, not something to skip.
    pub fn expect_event(
        &self,
        expected: CmEventKind,
        timeout: Option<Duration>,
        what: &'static str,
    ) -> Result<(), CmError> {
        let event = match timeout {
            Some(t) => self.next_event_timeout(t, what)?,
            None => self.next_event()?,
        };
        let got = event.kind();
        event.ack();
        if got != expected {
            return Err(CmError::UnexpectedEvent { expected, got });
        }
        Ok(())
    }
}
