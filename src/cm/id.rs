//! Connection identifier.

use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::mem;
use std::net::SocketAddrV4;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use super::event::EventChannel;
use crate::rdma::cq::Cq;
use crate::rdma::device::DeviceContext;
use crate::rdma::mr::RegisteredBuf;
use crate::rdma::pd::Pd;
use crate::utils::boilerplate::impl_ptr_wrapper_traits;
use crate::utils::interop::{from_c_ret, from_cm_ret};

/// Wrapper for `*mut rdma_cm_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct RdmaCmId(NonNull<rdma_cm_id>);

impl RdmaCmId {
    /// Destroy the identifier.
    ///
    /// # Safety
    ///
    /// - An identifier must not be destroyed more than once.
    /// - A queue pair created on it must be destroyed first.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = rdma_destroy_id(self.as_ptr());
        from_cm_ret(ret)
    }
}

impl_ptr_wrapper_traits!(rdma_cm_id, RdmaCmId);

fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: zero-initializing a POD type is safe.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

/// One RDMA-capable endpoint, listening or connected.
///
/// The identifier keeps its event channel alive through a clone, and its
/// `Drop` tears down the queue pair (if one was created) strictly before
/// the identifier itself; the held `Pd`/`Cq` clones in turn guarantee
/// the domain and completion queue outlive the queue pair.
pub struct CmId {
    id: RdmaCmId,
    // Keeps the channel alive for as long as the identifier exists.
    _chan: EventChannel,
    // Pinned by the QP; released after it in drop order.
    qp_deps: Option<(Pd, Cq)>,
}

impl CmId {
    /// Create a new identifier on the given event channel, using the TCP
    /// port space.
    pub fn new(chan: &EventChannel) -> io::Result<Self> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(
                chan.as_raw(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        from_cm_ret(ret)?;
        let id = NonNull::new(id).ok_or_else(IoError::last_os_error)?;
        Ok(Self {
            id: RdmaCmId(id),
            _chan: chan.clone(),
            qp_deps: None,
        })
    }

    /// Take ownership of the identifier surfaced by a connect-request
    /// event.
    ///
    /// # Safety
    ///
    /// `raw` must be the identifier of an unanswered connect request
    /// delivered on `chan`, not owned by anyone else.
    pub(crate) unsafe fn from_request(raw: NonNull<rdma_cm_id>, chan: &EventChannel) -> Self {
        Self {
            id: RdmaCmId(raw),
            _chan: chan.clone(),
            qp_deps: None,
        }
    }

    /// Get the underlying `rdma_cm_id` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut rdma_cm_id {
        self.id.as_ptr()
    }

    /// Get the verbs device context bound to this identifier, known only
    /// after address resolution (client) or a connect request (server).
    pub fn verbs(&self) -> Option<DeviceContext> {
        // SAFETY: the context stays valid while librdmacm is loaded and
        // resources on it live no longer than this connection.
        unsafe { DeviceContext::from_cm((*self.as_raw()).verbs) }
    }

    /// Bind the identifier to a local address.
    pub fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        let mut sin = sockaddr_in_from(addr);
        // SAFETY: FFI; `sin` lives across the call.
        let ret = unsafe { rdma_bind_addr(self.as_raw(), &mut sin as *mut _ as *mut _) };
        from_cm_ret(ret)
    }

    /// Start listening for incoming connection requests.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_listen(self.as_raw(), backlog) };
        from_cm_ret(ret)
    }

    /// Start resolving the destination address. Completion is reported
    /// as an address-resolved event on the channel.
    pub fn resolve_addr(&self, dst: SocketAddrV4, timeout_ms: c_int) -> io::Result<()> {
        let mut sin = sockaddr_in_from(dst);
        // SAFETY: FFI; `sin` lives across the call.
        let ret = unsafe {
            rdma_resolve_addr(
                self.as_raw(),
                ptr::null_mut(),
                &mut sin as *mut _ as *mut _,
                timeout_ms,
            )
        };
        from_cm_ret(ret)
    }

    /// Start resolving a route to the resolved address. Completion is
    /// reported as a route-resolved event on the channel.
    pub fn resolve_route(&self, timeout_ms: c_int) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_resolve_route(self.as_raw(), timeout_ms) };
        from_cm_ret(ret)
    }

    /// Create the queue pair for this connection: reliable transport,
    /// capacity of exactly one outstanding send and one outstanding
    /// receive (no pipelining, by design), both queues reporting to the
    /// given completion queue.
    pub fn create_qp(&mut self, pd: &Pd, cq: &Cq) -> io::Result<()> {
        // SAFETY: zero-initializing a POD type is safe.
        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = cq.as_raw();
        attr.recv_cq = cq.as_raw();
        attr.cap.max_send_wr = 1;
        attr.cap.max_recv_wr = 1;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;

        // SAFETY: FFI.
        let ret = unsafe { rdma_create_qp(self.as_raw(), pd.as_raw(), &mut attr) };
        from_cm_ret(ret)?;
        self.qp_deps = Some((pd.clone(), cq.clone()));
        Ok(())
    }

    /// Initiate a connection to the peer the route was resolved to.
    pub fn connect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_connect(self.as_raw(), ptr::null_mut()) };
        from_cm_ret(ret)
    }

    /// Accept the pending connection request this identifier represents.
    pub fn accept(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_accept(self.as_raw(), ptr::null_mut()) };
        from_cm_ret(ret)
    }

    /// Disconnect the established connection.
    pub fn disconnect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_disconnect(self.as_raw()) };
        from_cm_ret(ret)
    }

    fn qp(&self) -> io::Result<*mut ibv_qp> {
        // SAFETY: the identifier is valid while `self` is alive.
        let qp = unsafe { (*self.as_raw()).qp };
        if qp.is_null() {
            return Err(IoError::new(
                IoErrorKind::NotConnected,
                "no queue pair on this identifier",
            ));
        }
        Ok(qp)
    }

    /// Post a signaled send of the whole buffer.
    pub fn post_send(&self, buf: &RegisteredBuf) -> io::Result<()> {
        let mut sge = buf.sge();
        // SAFETY: zero-initializing a POD type is safe.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let mut bad_wr = ptr::null_mut();

        // SAFETY: FFI; the buffer registration outlives the request.
        let ret = unsafe { ibv_post_send(self.qp()?, &mut wr, &mut bad_wr) };
        from_c_ret(ret)
    }

    /// Post a receive for the whole buffer.
    pub fn post_recv(&self, buf: &mut RegisteredBuf) -> io::Result<()> {
        let mut sge = buf.sge();
        // SAFETY: zero-initializing a POD type is safe.
        let mut wr: ibv_recv_wr = unsafe { mem::zeroed() };
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad_wr = ptr::null_mut();

        // SAFETY: FFI; the buffer registration outlives the request.
        let ret = unsafe { ibv_post_recv(self.qp()?, &mut wr, &mut bad_wr) };
        from_c_ret(ret)
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        if self.qp_deps.is_some() {
            // SAFETY: the QP was created by `rdma_create_qp` on this
            // identifier and is destroyed exactly once, before the
            // identifier, the CQ and the PD.
            unsafe { rdma_destroy_qp(self.as_raw()) };
        }
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.id.destroy() }.expect("cannot destroy CM ID on drop");
    }
}

/// Accept a connection request on a raw identifier currently owned by a
/// worker.
///
/// # Safety
///
/// `raw` must point to a live identifier with a queue pair; the owner
/// must not destroy it for the duration of the call.
pub(crate) unsafe fn accept_raw(raw: *mut rdma_cm_id) -> io::Result<()> {
    // SAFETY: per the caller's contract.
    let ret = rdma_accept(raw, ptr::null_mut());
    from_cm_ret(ret)
}

/// Disconnect a raw identifier currently owned by a worker.
///
/// # Safety
///
/// `raw` must point to a live identifier; the owner must not destroy it
/// for the duration of the call.
pub(crate) unsafe fn disconnect_raw(raw: *mut rdma_cm_id) -> io::Result<()> {
    // SAFETY: per the caller's contract.
    let ret = rdma_disconnect(raw);
    from_cm_ret(ret)
}
