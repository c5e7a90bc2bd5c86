//! An RDMA library consisting of a safe RDMA wrapping and several useful
//! functionalities to build RDMA connections.
//!
//! Main functionalities are in the [`rdma`] mod, which provides mostly-safe
//! wrappers of RDMA resources and data-plane operations.
//!
//! Aside from RDMA functionalities, there are TCP-based out-of-band bootstrap
//! utilities in the [`ctrl`] mod ([`ctrl::Listener`] / [`ctrl::Dialer`]), a
//! completion queue pair abstraction in [`cqp`], and a family of multiclient
//! message transports in [`transport`] built on top of them. Some
//! higher-level wrappings of RDMA resources are in the [`wrap`] mod.
//!
//! **WARNING: The interfaces are unstable and up to change!**
//!
//! [`rdma-sys`]: https://docs.rs/rdma-sys/latest/rdma_sys/

#[cfg(not(target_os = "linux"))]
compile_error!("this crate currently only supports Linux");

/// Bindings of C interfaces.
pub mod bindings;

/// Shared utility functions.
#[macro_use]
mod utils;

/// RDMA functionalities.
/// Not to be publicly exposed, instead `pub use` necessary items.
mod rdma;

pub use rdma::context::*;
pub use rdma::cq::*;
pub use rdma::gid::*;
pub use rdma::mr::*;
pub use rdma::nic::*;
pub use rdma::pd::*;
pub use rdma::qp::*;

/// Type aliases for RDMA-related operations.
pub use rdma::type_alias;

/// Completion queue pair and multiclient message transport strategies.
pub mod cqp;
pub mod transport;

/// Connection management utilities.
pub mod ctrl;

/// Higher-level wrappings of RDMA resources.
pub mod wrap;
