//! Higher-level wrappings of RDMA resources.

mod registered_mem;

pub use self::registered_mem::*;
