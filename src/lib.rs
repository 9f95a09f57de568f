//! A reliable, connection-oriented RDMA echo channel built atop
//! `librdmacm`, exchanging one fixed-size message per round-trip and
//! echoing it back reversed.
//!
//! The crate wraps the raw `rdma-sys` bindings in `Arc`-based resource
//! holder types ([`rdma::pd::Pd`], [`rdma::cq::Cq`],
//! [`rdma::mr::RegisteredBuf`], [`cm::EventChannel`], [`cm::CmId`]), so
//! releasing resources in dependency order is guaranteed on every exit
//! path: a child keeps its parents alive through clones and tears itself
//! down first when dropped.
//!
//! On top of those sit the two roles:
//!
//! - [`EchoServer`] runs the connection-management event loop, spawning
//!   one worker thread per accepted connection; each worker drives its
//!   own completion queue with exactly one outstanding send or receive
//!   at a time.
//! - [`EchoClient`] is a single-threaded synchronous session: connect,
//!   exchange fixed 1024-byte messages, close with the `"BYE"` sentinel.
//!
//! # Example
//!
//! ```no_run
//! use rcmecho::EchoClient;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let mut client = EchoClient::connect("192.168.200.53", 12345)?;
//!     client.post_send("hello")?;
//!     assert_eq!(client.post_recv()?, "olleh");
//!     client.close()?;
//!     Ok(())
//! }
//! ```

mod utils;

pub mod cm;
pub mod msg;
pub mod rdma;

mod client;
mod server;

pub use client::EchoClient;
pub use server::EchoServer;
pub use utils::token::StopToken;
