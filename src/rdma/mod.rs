//! Safe wrappers over the RDMA data-plane resources.

pub mod cq;
pub mod device;
pub mod mr;
pub mod pd;
pub mod wc;
