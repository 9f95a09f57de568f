//! Work completion.

use std::fmt;
use std::mem;

use rdma_sys::*;
use thiserror::Error;

/// Opcode of a completion queue entry.
///
/// Only send and receive completions occur on an echo connection; every
/// other opcode is carried through for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// Receive request.
    Recv,
    /// Any other work request kind.
    Other(u32),
}

impl From<u32> for WcOpcode {
    fn from(wc_opcode: u32) -> Self {
        match wc_opcode {
            x if x == ibv_wc_opcode::IBV_WC_SEND as u32 => WcOpcode::Send,
            x if x == ibv_wc_opcode::IBV_WC_RECV as u32 => WcOpcode::Recv,
            x => WcOpcode::Other(x),
        }
    }
}

/// A non-success completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("work completion failed with status {status}")]
pub struct WcError {
    /// The raw `ibv_wc_status` value.
    pub status: u32,
}

impl WcError {
    /// Whether the work request was flushed because its queue pair
    /// transitioned into the error state (the normal aftermath of a
    /// disconnect with a receive still posted).
    #[inline]
    pub fn is_flush(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_WR_FLUSH_ERR as u32
    }
}

/// Work completion entry.
///
/// Transparently wraps an `ibv_wc` polled from the completion queue.
#[repr(transparent)]
pub struct Wc(pub(crate) ibv_wc);

unsafe impl Send for Wc {}
unsafe impl Sync for Wc {}

impl Wc {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    /// Get the completion status as a `Result`.
    ///
    /// On success, return the number of bytes transferred.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcError> {
        if self.0.status as u32 == ibv_wc_status::IBV_WC_SUCCESS as u32 {
            Ok(self.0.byte_len as usize)
        } else {
            Err(WcError {
                status: self.0.status as u32,
            })
        }
    }

    /// Get the opcode of the completed work request.
    ///
    /// Only valid when the completion status is success.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        WcOpcode::from(self.0.opcode as u32)
    }
}

impl Default for Wc {
    /// Create a zeroed work completion entry.
    fn default() -> Self {
        // SAFETY: zero-initializing a POD type is safe.
        unsafe { mem::zeroed() }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &(self.0.status as u32))
            .finish()
    }
}
