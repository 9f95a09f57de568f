//! Connection-management: the out-of-band control plane that resolves
//! addresses and routes, establishes connections and tears them down
//! before and after the data-plane queue pairs are usable.

pub mod event;
pub mod id;

use std::io;

use thiserror::Error;

pub use self::event::{CmEvent, CmEventKind, EventChannel};
pub use self::id::CmId;

/// Connection-management error type.
#[derive(Debug, Error)]
pub enum CmError {
    /// `librdmacm` interfaces returned an error.
    #[error("I/O error from librdmacm")]
    Io(#[from] io::Error),

    /// A confirmation event did not arrive within its bound.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The handshake produced an event out of sequence.
    #[error("expected {expected:?} event, got {got:?}")]
    UnexpectedEvent {
        expected: CmEventKind,
        got: CmEventKind,
    },

    /// No resolved address candidate was reachable.
    #[error("no address candidate could be resolved")]
    AddrUnresolvable,
}
