//! Registered message buffers.

use std::ffi::c_void;
use std::io::{self, Error as IoError};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use rdma_sys::*;

use super::pd::Pd;
use crate::utils::boilerplate::impl_ptr_wrapper_traits;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_mr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvMr(NonNull<ibv_mr>);

impl IbvMr {
    /// Get the local key of the memory region.
    pub fn lkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).lkey }
    }

    /// Deregister the MR.
    ///
    /// # Safety
    ///
    /// - An MR must not be deregistered more than once.
    /// - Deregistered MRs must not be used anymore.
    pub unsafe fn dereg(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dereg_mr(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ptr_wrapper_traits!(ibv_mr, IbvMr);

/// A fixed-size message buffer registered as an RDMA memory region.
///
/// Owns both the heap buffer and its registration; dropping deregisters
/// the MR strictly before the buffer memory is freed, and the held `Pd`
/// clone keeps the protection domain alive until then.
pub struct RegisteredBuf {
    mr: IbvMr,
    buf: Box<[u8]>,
    _pd: Pd,
}

impl RegisteredBuf {
    /// Allocate a zeroed buffer of the given length and register it with
    /// the protection domain.
    pub fn new(pd: &Pd, len: usize) -> io::Result<Self> {
        let buf = vec![0u8; len].into_boxed_slice();
        let access = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
            .0;
        // SAFETY: FFI; the buffer outlives the registration by the drop
        // order of this struct.
        let mr = unsafe {
            ibv_reg_mr(
                pd.as_raw(),
                buf.as_ptr() as *mut c_void,
                len,
                access as i32,
            )
        };
        let mr = NonNull::new(mr).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            mr: IbvMr(mr),
            buf,
            _pd: pd.clone(),
        })
    }

    /// Get the local key used in work requests touching this buffer.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    /// Build a single-element scatter/gather list covering the whole
    /// buffer.
    #[inline]
    pub(crate) fn sge(&self) -> ibv_sge {
        ibv_sge {
            addr: self.buf.as_ptr() as u64,
            length: self.buf.len() as u32,
            lkey: self.lkey(),
        }
    }

    /// Zero the buffer contents.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.fill(0);
    }
}

impl Deref for RegisteredBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.buf.as_ref()
    }
}

impl DerefMut for RegisteredBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut()
    }
}

impl Drop for RegisteredBuf {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.mr.dereg() }.expect("cannot dereg MR on drop");
    }
}
