//! RDMA device discovery.

use std::io::{self, Error as IoError};
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

/// Ownership holder of the device array returned by `rdma_get_devices`.
struct DeviceListInner {
    list: NonNull<*mut ibv_context>,
    num: usize,
}

// The array is immutable after creation.
unsafe impl Send for DeviceListInner {}
unsafe impl Sync for DeviceListInner {}

impl Drop for DeviceListInner {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `rdma_get_devices` and is freed
        // only here.
        unsafe { rdma_free_devices(self.list.as_ptr()) };
    }
}

/// The RDMA devices currently usable through `librdmacm`.
///
/// The device contexts handed out by [`DeviceList::get`] stay valid for
/// as long as any clone of the list (or any context derived from it) is
/// alive.
#[derive(Clone)]
pub struct DeviceList {
    inner: Arc<DeviceListInner>,
}

impl DeviceList {
    /// Enumerate the available devices.
    pub fn available() -> io::Result<Self> {
        let mut num = 0i32;
        // SAFETY: FFI.
        let list = unsafe { rdma_get_devices(&mut num) };
        let list = NonNull::new(list).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            inner: Arc::new(DeviceListInner {
                list,
                num: num.max(0) as usize,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.num
    }

    pub fn is_empty(&self) -> bool {
        self.inner.num == 0
    }

    /// Get the `index`-th device context.
    pub fn get(&self, index: usize) -> Option<DeviceContext> {
        if index >= self.inner.num {
            return None;
        }
        // SAFETY: in-bounds read of the array owned by `inner`.
        let ctx = unsafe { *self.inner.list.as_ptr().add(index) };
        NonNull::new(ctx).map(|ctx| DeviceContext {
            ctx,
            _owner: Some(self.clone()),
        })
    }

    /// Get the first device context, the one connections are scoped to.
    pub fn first(&self) -> Option<DeviceContext> {
        self.get(0)
    }
}

/// A verbs device context.
///
/// This type never owns the underlying `ibv_context`: contexts come
/// either from a [`DeviceList`] (which keeps them open) or from a
/// connection identifier after address resolution (`librdmacm` owns
/// them). It is therefore freely cloneable.
#[derive(Clone)]
pub struct DeviceContext {
    ctx: NonNull<ibv_context>,
    _owner: Option<DeviceList>,
}

unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl DeviceContext {
    /// Wrap a context borrowed from a connection identifier.
    ///
    /// # Safety
    ///
    /// The context must stay valid for the lifetime of every resource
    /// created from the returned handle.
    pub(crate) unsafe fn from_cm(ctx: *mut ibv_context) -> Option<Self> {
        NonNull::new(ctx).map(|ctx| DeviceContext { ctx, _owner: None })
    }

    /// Get the underlying `ibv_context` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }
}
