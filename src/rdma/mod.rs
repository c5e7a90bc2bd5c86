// RDMA contexts.
pub mod context;

// RDMA completion queues.
pub mod cq;

// RDMA device GIDs.
pub mod gid;

// Local and remote RDMA memory regions.
pub mod mr;

// RDMA hardware resource discovery.
pub mod nic;

// RDMA protection domains.
pub mod pd;

// RDMA queue pairs.
pub mod qp;

// Type aliases for RDMA-related operations.
pub mod type_alias;
