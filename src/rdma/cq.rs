//! Completion channel and completion queue.

use std::io::{self, Error as IoError};
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use rdma_sys::*;
use thiserror::Error;

use super::device::DeviceContext;
use super::wc::Wc;
use crate::utils::boilerplate::impl_ptr_wrapper_traits;
use crate::utils::interop::{from_c_ret, from_cm_ret, poll_readable};
use crate::utils::token::{StopToken, CANCEL_POLL_SLICE};

/// Wrapper for `*mut ibv_comp_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvCompChannel(NonNull<ibv_comp_channel>);

impl IbvCompChannel {
    /// Destroy the completion channel.
    ///
    /// # Safety
    ///
    /// - A channel must not be destroyed more than once.
    /// - No completion queue may still be bound to it.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_comp_channel(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ptr_wrapper_traits!(ibv_comp_channel, IbvCompChannel);

/// Completion channel: the wait/notify primitive consumers block on
/// until the completion queue bound to it has new entries.
pub struct CompChannel {
    chan: IbvCompChannel,
}

impl CompChannel {
    /// Create a completion channel on the given device context.
    pub fn new(ctx: &DeviceContext) -> io::Result<Self> {
        // SAFETY: FFI.
        let chan = unsafe { ibv_create_comp_channel(ctx.as_raw()) };
        let chan = NonNull::new(chan).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            chan: IbvCompChannel(chan),
        })
    }

    /// Get the underlying `ibv_comp_channel` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_comp_channel {
        self.chan.as_ptr()
    }

    /// The file descriptor notifications are delivered on.
    #[inline]
    fn fd(&self) -> c_int {
        // SAFETY: the pointer is valid as long as `self` is alive.
        unsafe { (*self.as_raw()).fd }
    }
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.chan.destroy() }.expect("cannot destroy completion channel on drop");
    }
}

/// Wrapper for `*mut ibv_cq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvCq(NonNull<ibv_cq>);

impl IbvCq {
    /// Destroy the CQ.
    ///
    /// # Safety
    ///
    /// - A CQ must not be destroyed more than once.
    /// - Destroyed CQs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_cq(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ptr_wrapper_traits!(ibv_cq, IbvCq);

/// Ownership holder of completion queue.
///
/// The CQ is destroyed in `drop` before the channel field runs its own
/// destructor, keeping the CQ-before-channel teardown order.
struct CqInner {
    chan: CompChannel,
    cq: IbvCq,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.cq.destroy() }.expect("cannot destroy CQ on drop");
    }
}

/// Completion-wait error type.
#[derive(Debug, Error)]
pub enum CqError {
    /// `libibverbs` interfaces returned an error.
    #[error("I/O error from ibverbs")]
    Io(#[from] IoError),

    /// The stop token was set while waiting for a completion.
    #[error("stopped while waiting for a completion")]
    Stopped,

    /// The completion channel woke us up but the queue had no entry.
    /// With notification re-armed after every wakeup this indicates a
    /// logic error, not a condition to loop past.
    #[error("completion queue empty after a channel wakeup")]
    EmptyAfterWakeup,
}

/// Completion queue bound to its own completion channel.
///
/// One per connection. Consumers drive it through
/// [`next_completion`](Cq::next_completion), which upholds the channel
/// protocol: every delivered event is acknowledged and notification is
/// re-armed before the entry is polled, so wakeups are never lost.
pub struct Cq {
    /// Cached CQ pointer.
    cq: IbvCq,

    /// CQ body.
    inner: Arc<CqInner>,
}

impl Clone for Cq {
    fn clone(&self) -> Self {
        Self {
            cq: self.cq,
            inner: self.inner.clone(),
        }
    }
}

impl Cq {
    /// The default CQ depth.
    ///
    /// At most one send or receive is in flight at a time on an echo
    /// connection, so two entries always suffice.
    pub const DEFAULT_CQ_DEPTH: u32 = 2;

    /// Create a completion queue of the given capacity, bound to a fresh
    /// completion channel, with notification armed.
    pub fn new(ctx: &DeviceContext, capacity: u32) -> io::Result<Self> {
        let chan = CompChannel::new(ctx)?;

        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                capacity as i32,
                ptr::null_mut(),
                chan.as_raw(),
                0,
            )
        };
        // On failure `chan` is released by its own destructor.
        let cq = NonNull::new(cq).ok_or_else(IoError::last_os_error)?;
        let cq = IbvCq(cq);

        let this = Self {
            inner: Arc::new(CqInner { chan, cq }),
            cq,
        };
        this.req_notify()?;
        Ok(this)
    }

    /// Get the underlying `ibv_cq` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Re-arm completion notification.
    fn req_notify(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_req_notify_cq(self.as_raw(), 0) };
        from_c_ret(ret)
    }

    /// Non-blockingly poll one work completion.
    ///
    /// It is the caller's responsibility to check the status code of the
    /// returned work completion entry.
    #[inline]
    pub fn poll_one(&self) -> io::Result<Option<Wc>> {
        let mut wc = <MaybeUninit<Wc>>::uninit();
        // SAFETY: FFI, and that `Wc` is transparent over `ibv_wc`.
        let num = unsafe { ibv_poll_cq(self.as_raw(), 1, wc.as_mut_ptr().cast()) };
        if num >= 0 {
            Ok(if num == 0 {
                None
            } else {
                // SAFETY: `ibv_poll_cq` returning 1 means `wc` is initialized.
                Some(unsafe { wc.assume_init() })
            })
        } else {
            // `ibv_poll_cq` reports errors as a negated errno value.
            Err(io::Error::from_raw_os_error(-num))
        }
    }

    /// Block until the next work completion arrives and return it.
    ///
    /// This is the sole suspension point of the data plane: wait for a
    /// channel wakeup (observing `stop` once per slice), consume and
    /// acknowledge the event, re-arm notification, then poll exactly one
    /// entry. It is the caller's responsibility to check the status code
    /// of the returned entry.
    pub fn next_completion(&self, stop: &StopToken) -> Result<Wc, CqError> {
        loop {
            if stop.is_stopped() {
                return Err(CqError::Stopped);
            }
            if poll_readable(self.inner.chan.fd(), Some(CANCEL_POLL_SLICE))? {
                break;
            }
        }

        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut();
        // SAFETY: FFI; the channel is readable, so this does not block.
        let ret = unsafe { ibv_get_cq_event(self.inner.chan.as_raw(), &mut cq, &mut cq_context) };
        from_cm_ret(ret)?;
        debug_assert_eq!(cq, self.as_raw());

        // SAFETY: FFI; exactly one event was delivered above.
        unsafe { ibv_ack_cq_events(self.as_raw(), 1) };
        self.req_notify()?;

        match self.poll_one()? {
            Some(wc) => Ok(wc),
            None => Err(CqError::EmptyAfterWakeup),
        }
    }
}
