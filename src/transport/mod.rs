//! Multiclient RDMA message transport strategies sharing a common
//! server/client request-response contract: Distinct-MR, Doorbell, and Recv.
//!
//! All three variants are built on [`crate::cqp::CompletionQueuePair`] for
//! completion handling and [`crate::ctrl`] for the out-of-band handshake;
//! they differ only in how the request/response payload crosses the wire.

pub mod distinct_mr;
pub mod doorbell;
pub mod recv;

use std::io;
use std::mem;
use std::ptr;

use thiserror::Error;

use crate::cqp::CompletionQueuePair;
use crate::cqp::CqpError;
use crate::ctrl::{Bootstrap, BootstrapError};
use crate::rdma::nic::Port;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps, QpCreationError, QpEndpoint, QpType};

/// Dense client identifier assigned at `accept()` time, starting from 0.
pub type ClientId = usize;

/// Default cap on outstanding unacknowledged work requests per QP.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 128;

/// Errors raised by a multiclient transport endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The out-of-band bootstrap handshake failed.
    #[error("bootstrap error")]
    Bootstrap(#[from] BootstrapError),

    /// A `libibverbs` call (MR registration, QP bring-up, WR posting) failed.
    #[error("verbs error")]
    Verbs(#[from] io::Error),

    /// A completion carried a non-success status or an unexpected opcode.
    #[error("completion error")]
    Completion(#[from] CqpError),

    /// A sequence, doorbell, or message-size disagreement was observed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `maxConcurrency` was exceeded: `accept()` called more times than the
    /// server was constructed to support.
    #[error("server at capacity ({0} clients)")]
    AtCapacity(usize),
}

impl From<QpCreationError> for TransportError {
    fn from(e: QpCreationError) -> Self {
        match e {
            QpCreationError::IoError(e) => TransportError::Verbs(e),
            QpCreationError::CapabilityNotEnough(name, max, required) => TransportError::Protocol(
                format!("QP capability {name} supports up to {max}, {required} required"),
            ),
        }
    }
}

/// Bring up a reliable-connected QP and its completion queue pair on `pd`,
/// then complete the endpoint half of the bootstrap handshake.
///
/// The server always sends its endpoint first (matching the wire order
/// fixed in the bootstrap wire format); `is_server` selects which side of
/// the exchange to perform first.
pub(crate) fn handshake_qp(
    pd: &Pd,
    port: &Port,
    gid_index: Option<u8>,
    bs: &mut Bootstrap,
    caps: QpCaps,
    is_server: bool,
) -> Result<(Qp, CompletionQueuePair), TransportError> {
    let cqp = CompletionQueuePair::new(pd.context(), caps.max_send_wr, caps.max_recv_wr)?;
    let mut qp = Qp::builder()
        .send_cq(cqp.send_cq())
        .recv_cq(cqp.recv_cq())
        .caps(caps)
        .qp_type(QpType::Rc)
        .sq_sig_all(false)
        .build(pd)?;
    qp.bind_local_port(port, gid_index)?;

    let my_ep = qp.endpoint().expect("QP just bound to a local port");
    let peer_ep = if is_server {
        bs.send_endpoint(&my_ep)?;
        let (lid, qpn, _psn, gid) = bs.recv_endpoint()?;
        QpEndpoint {
            gid,
            lid,
            port_num: port.num(),
            qpn,
        }
    } else {
        let (lid, qpn, _psn, gid) = bs.recv_endpoint()?;
        bs.send_endpoint(&my_ep)?;
        QpEndpoint {
            gid,
            lid,
            port_num: port.num(),
            qpn,
        }
    };
    qp.bind_peer(peer_ep)?;

    Ok((qp, cqp))
}

/// A fixed-size message slot: payload followed by a trailing validity word.
///
/// The validity word is deliberately the highest-addressed field so that, on
/// HCAs that preserve intra-WR byte ordering, it becomes visible to a polling
/// peer only after the payload has landed. Implementations that cannot rely
/// on that ordering must split the write into two WRs with a fence between
/// them; this crate assumes single-WR ordering, as does the original design.
///
/// `validity` is a monotonically increasing, non-zero counter: it both flags
/// "message ready" and lets a poller detect stale or duplicate deliveries,
/// generalizing a plain alternating bit.
#[repr(C)]
pub(crate) struct Slot<T> {
    payload: T,
    validity: u64,
}

impl<T: Copy> Slot<T> {
    /// Size in bytes of a slot holding `T`.
    pub(crate) const SIZE: usize = mem::size_of::<Self>();

    /// Write the payload and validity word into the slot at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`Self::SIZE`] valid, writable bytes,
    /// suitably aligned for `Slot<T>`.
    pub(crate) unsafe fn write_at(base: *mut u8, payload: T, validity: u64) {
        let slot = base as *mut Slot<T>;
        ptr::addr_of_mut!((*slot).payload).write_volatile(payload);
        ptr::addr_of_mut!((*slot).validity).write_volatile(validity);
    }

    /// Read the validity word at `base` without touching the payload.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`Self::SIZE`] valid, readable bytes,
    /// suitably aligned for `Slot<T>`.
    pub(crate) unsafe fn peek_validity(base: *const u8) -> u64 {
        let slot = base as *const Slot<T>;
        ptr::addr_of!((*slot).validity).read_volatile()
    }

    /// Read the payload at `base` and reset its validity word to 0.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`Self::SIZE`] valid, writable bytes,
    /// suitably aligned for `Slot<T>`.
    pub(crate) unsafe fn take(base: *mut u8) -> T {
        let slot = base as *mut Slot<T>;
        let payload = ptr::addr_of!((*slot).payload).read_volatile();
        ptr::addr_of_mut!((*slot).validity).write_volatile(0);
        payload
    }
}

/// Advance a monotonically increasing, non-zero validity counter.
pub(crate) fn next_seq(seq: &mut u64) -> u64 {
    *seq = seq.wrapping_add(1);
    if *seq == 0 {
        *seq = 1;
    }
    *seq
}

/// Round `n` up to the next multiple of 16.
///
/// Used by the Doorbell server to align its per-client slot count, trading a
/// little unused capacity for friendlier memory layout.
pub(crate) fn round_up_16(n: usize) -> usize {
    (n + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_16_boundaries() {
        assert_eq!(round_up_16(0), 0);
        assert_eq!(round_up_16(1), 16);
        assert_eq!(round_up_16(16), 16);
        assert_eq!(round_up_16(17), 32);
        assert_eq!(round_up_16(31), 32);
    }

    #[test]
    fn slot_write_then_take_round_trips() {
        let mut buf = [0u8; Slot::<u32>::SIZE];
        unsafe {
            assert_eq!(Slot::<u32>::peek_validity(buf.as_ptr()), 0);
            Slot::<u32>::write_at(buf.as_mut_ptr(), 42, 7);
            assert_eq!(Slot::<u32>::peek_validity(buf.as_ptr()), 7);
            assert_eq!(Slot::<u32>::take(buf.as_mut_ptr()), 42);
            assert_eq!(Slot::<u32>::peek_validity(buf.as_ptr()), 0);
        }
    }
}
