//! Protection domain.

use std::io::{self, Error as IoError};
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use super::device::DeviceContext;
use crate::utils::boilerplate::impl_ptr_wrapper_traits;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_pd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvPd(NonNull<ibv_pd>);

impl IbvPd {
    /// Deallocate the PD.
    ///
    /// # Safety
    ///
    /// - A PD must not be deallocated more than once.
    /// - Deallocated PDs must not be used anymore.
    pub unsafe fn dealloc(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dealloc_pd(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ptr_wrapper_traits!(ibv_pd, IbvPd);

/// Ownership holder of protection domain.
struct PdInner {
    ctx: DeviceContext,
    pd: IbvPd,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.pd.dealloc() }.expect("cannot dealloc PD on drop");
    }
}

/// Protection domain.
///
/// One per role; it scopes every memory region and queue pair of the
/// connections created on its device context. Clones share the same
/// underlying domain, and the domain is deallocated only after every
/// dependent resource holding a clone has been released.
pub struct Pd {
    /// Cached PD pointer.
    pd: IbvPd,

    /// PD body.
    inner: Arc<PdInner>,
}

impl Clone for Pd {
    fn clone(&self) -> Self {
        Self {
            pd: self.pd,
            inner: self.inner.clone(),
        }
    }
}

impl Pd {
    /// Allocate a protection domain on the given device context.
    pub fn alloc(ctx: &DeviceContext) -> io::Result<Self> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx.as_raw()) };
        let pd = NonNull::new(pd).ok_or_else(IoError::last_os_error)?;
        let pd = IbvPd::from(pd);
        Ok(Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                pd,
            }),
            pd,
        })
    }

    /// Get the underlying `ibv_pd` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    /// Get the device context this PD lives on.
    pub fn context(&self) -> &DeviceContext {
        &self.inner.ctx
    }
}
