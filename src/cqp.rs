//! Completion queue pair: a send CQ and a receive CQ sharing one completion
//! event channel, with non-blocking, busy-blocking, and event-driven wait.

use std::io::{self, Error as IoError};
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use thiserror::Error;

use crate::bindings::*;
use crate::rdma::context::Context;
use crate::rdma::cq::{Cq, CqCreationError, Wc, WcOpcode, WcStatus};
use crate::utils::interop::from_c_ret;

/// Errors raised while polling or waiting on a [`CompletionQueuePair`].
#[derive(Debug, Error)]
pub enum CqpError {
    /// `libibverbs` interfaces returned an error.
    #[error("I/O error from ibverbs")]
    IoError(#[from] IoError),

    /// A completion carried a non-success status.
    #[error("completion failed with status: {0}")]
    Completion(WcStatus),

    /// A completion's opcode did not match what the caller expected.
    #[error("unexpected opcode: expected {expected:?}, got {got:?}")]
    UnexpectedOpcode { expected: WcOpcode, got: WcOpcode },
}

/// Which side of the pair a [`CompletionQueuePair::wait_for_completion`] call
/// is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionFilter {
    /// Only accept completions from the send CQ.
    SendOnly,
    /// Only accept completions from the receive CQ.
    RecvOnly,
    /// Accept completions from either CQ.
    Any,
}

impl CompletionFilter {
    #[inline]
    fn accepts(self, is_send: bool) -> bool {
        match self {
            CompletionFilter::SendOnly => is_send,
            CompletionFilter::RecvOnly => !is_send,
            CompletionFilter::Any => true,
        }
    }
}

/// Wrapper for `*mut ibv_comp_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct IbvCompChannel(NonNull<ibv_comp_channel>);

impl IbvCompChannel {
    unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_comp_channel(self.0.as_ptr());
        from_c_ret(ret)
    }
}

/// A completion cached while waiting for a completion on the other CQ.
struct CachedCompletion {
    is_send: bool,
    wr_id: u64,
    status: WcStatus,
}

/// Remove and return the first cached completion `filter` accepts, if any.
fn take_cached(cached: &mut Vec<CachedCompletion>, filter: CompletionFilter) -> Option<CachedCompletion> {
    let pos = cached.iter().position(|c| filter.accepts(c.is_send))?;
    Some(cached.swap_remove(pos))
}

/// Pairs a send CQ and a receive CQ behind one completion event channel,
/// serialising event-driven completion draining across threads with a cache
/// of completions seen out-of-order relative to the caller's filter.
pub struct CompletionQueuePair {
    channel: IbvCompChannel,
    // Dropped explicitly, before `channel`, in `Drop::drop`: destroying the
    // channel while a CQ created against it is still alive fails with EBUSY.
    send_cq: ManuallyDrop<Cq>,
    recv_cq: ManuallyDrop<Cq>,
    cached: Mutex<Vec<CachedCompletion>>,
}

impl CompletionQueuePair {
    /// Create a new completion queue pair on the given context, with the
    /// given send/receive CQ depths.
    pub fn new(ctx: &Context, send_depth: u32, recv_depth: u32) -> Result<Self, CqpError> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(ctx.as_raw()) };
        let channel = NonNull::new(channel).ok_or_else(IoError::last_os_error)?;
        let channel = IbvCompChannel(channel);

        let send_cq = Cq::with_channel(ctx, send_depth, channel.0.as_ptr())
            .map_err(Self::map_cq_creation_err)?;
        let recv_cq = Cq::with_channel(ctx, recv_depth, channel.0.as_ptr())
            .map_err(Self::map_cq_creation_err)?;

        send_cq.req_notify(false)?;
        recv_cq.req_notify(false)?;

        Ok(Self {
            channel,
            send_cq: ManuallyDrop::new(send_cq),
            recv_cq: ManuallyDrop::new(recv_cq),
            cached: Mutex::new(Vec::new()),
        })
    }

    fn map_cq_creation_err(e: CqCreationError) -> CqpError {
        match e {
            CqCreationError::IoError(e) => CqpError::IoError(e),
            CqCreationError::TooManyCqes(max) => CqpError::IoError(IoError::new(
                io::ErrorKind::InvalidInput,
                format!("CQ capacity too large (maximum: {max})"),
            )),
        }
    }

    /// Get the send completion queue.
    #[inline]
    pub fn send_cq(&self) -> &Cq {
        &*self.send_cq
    }

    /// Get the receive completion queue.
    #[inline]
    pub fn recv_cq(&self) -> &Cq {
        &*self.recv_cq
    }

    /// Check a polled work completion against its expected opcode, if any.
    fn check(wc: &Wc, expected_opcode: Option<WcOpcode>) -> Result<u64, CqpError> {
        let status = wc.status();
        if status != WcStatus::Success {
            return Err(CqpError::Completion(status));
        }
        let opcode = wc.opcode();
        if let Some(expected) = expected_opcode {
            if opcode != expected {
                return Err(CqpError::UnexpectedOpcode {
                    expected,
                    got: opcode,
                });
            }
        }
        Ok(wc.wr_id())
    }

    /// Non-blockingly poll the send CQ once.
    ///
    /// Fails if the polled completion's status is not success, or if
    /// `expected_opcode` is given and does not match the completion's opcode.
    pub fn poll_send(&self, expected_opcode: Option<WcOpcode>) -> Result<Option<u64>, CqpError> {
        match self.send_cq.poll_one()? {
            Some(wc) => Self::check(&wc, expected_opcode).map(Some),
            None => Ok(None),
        }
    }

    /// Non-blockingly poll the receive CQ once. Fails if the polled
    /// completion's status is not success, or if its opcode is not a RECV
    /// opcode.
    pub fn poll_recv(&self) -> Result<Option<u64>, CqpError> {
        match self.recv_cq.poll_one()? {
            Some(wc) => {
                let status = wc.status();
                if status != WcStatus::Success {
                    return Err(CqpError::Completion(status));
                }
                Ok(Some(wc.wr_id()))
            }
            None => Ok(None),
        }
    }

    /// Busy-poll the send CQ until a completion is produced.
    pub fn busy_poll_send(&self, expected_opcode: Option<WcOpcode>) -> Result<u64, CqpError> {
        loop {
            if let Some(wr_id) = self.poll_send(expected_opcode)? {
                return Ok(wr_id);
            }
        }
    }

    /// Busy-poll the receive CQ until a completion is produced.
    pub fn busy_poll_recv(&self) -> Result<u64, CqpError> {
        loop {
            if let Some(wr_id) = self.poll_recv()? {
                return Ok(wr_id);
            }
        }
    }

    /// Block on the shared event channel until a completion satisfying
    /// `filter` is available, returning whether it came from the send CQ and
    /// its work request ID.
    ///
    /// May be satisfied immediately from the cache of completions previously
    /// drained for another waiter. Otherwise, blocks on the event channel,
    /// re-arms the signalled CQ, drains it completely, and caches every
    /// completion that does not satisfy `filter` for a future waiter.
    pub fn wait_for_completion(&self, filter: CompletionFilter) -> Result<(bool, u64), CqpError> {
        {
            let mut cached = self.cached.lock().unwrap();
            if let Some(c) = take_cached(&mut cached, filter) {
                if c.status != WcStatus::Success {
                    return Err(CqpError::Completion(c.status));
                }
                return Ok((c.is_send, c.wr_id));
            }
        }

        loop {
            let mut ev_cq: *mut ibv_cq = ptr::null_mut();
            let mut ev_ctx: *mut std::ffi::c_void = ptr::null_mut();
            // SAFETY: FFI; blocks until an event arrives.
            let ret = unsafe {
                ibv_get_cq_event(self.channel.0.as_ptr(), &mut ev_cq, &mut ev_ctx)
            };
            if ret != 0 {
                return Err(CqpError::IoError(IoError::last_os_error()));
            }

            let is_send = ev_cq == self.send_cq.as_raw();
            let cq = if is_send { &self.send_cq } else { &self.recv_cq };

            // SAFETY: FFI; acks exactly the one event just received.
            unsafe { ibv_ack_cq_events(ev_cq, 1) };

            // Re-arm before draining, so completions racing with the drain
            // are not lost.
            cq.req_notify(false)?;

            let mut drained = self.cached.lock().unwrap();
            let mut found = None;
            loop {
                let wc = cq.poll_one()?;
                let wc = match wc {
                    Some(wc) => wc,
                    None => break,
                };
                let status = wc.status();
                let wr_id = wc.wr_id();
                if found.is_none() && filter.accepts(is_send) {
                    found = Some((is_send, wr_id, status));
                } else {
                    drained.push(CachedCompletion {
                        is_send,
                        wr_id,
                        status,
                    });
                }
            }
            drop(drained);

            if let Some((is_send, wr_id, status)) = found {
                if status != WcStatus::Success {
                    return Err(CqpError::Completion(status));
                }
                return Ok((is_send, wr_id));
            }
            // Nothing in this batch matched the filter; go back to waiting
            // for the next event.
        }
    }
}

impl Drop for CompletionQueuePair {
    fn drop(&mut self) {
        // SAFETY: each field is dropped at most once, and before the channel
        // they're bound to — `ibv_destroy_comp_channel` fails with EBUSY
        // while either CQ is still alive.
        unsafe {
            ManuallyDrop::drop(&mut self.send_cq);
            ManuallyDrop::drop(&mut self.recv_cq);
        }
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { self.channel.destroy() }.expect("cannot destroy completion channel on drop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(is_send: bool, wr_id: u64) -> CachedCompletion {
        CachedCompletion {
            is_send,
            wr_id,
            status: WcStatus::Success,
        }
    }

    #[test]
    fn filter_accepts_matches_its_side() {
        assert!(CompletionFilter::SendOnly.accepts(true));
        assert!(!CompletionFilter::SendOnly.accepts(false));
        assert!(!CompletionFilter::RecvOnly.accepts(true));
        assert!(CompletionFilter::RecvOnly.accepts(false));
        assert!(CompletionFilter::Any.accepts(true));
        assert!(CompletionFilter::Any.accepts(false));
    }

    #[test]
    fn take_cached_removes_first_match_and_leaves_rest() {
        let mut cache = vec![cached(false, 1), cached(false, 2), cached(true, 3)];
        let found = take_cached(&mut cache, CompletionFilter::SendOnly).unwrap();
        assert_eq!(found.wr_id, 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.iter().all(|c| !c.is_send));
    }

    #[test]
    fn take_cached_returns_none_without_mutating() {
        let mut cache = vec![cached(false, 1), cached(false, 2)];
        assert!(take_cached(&mut cache, CompletionFilter::SendOnly).is_none());
        assert_eq!(cache.len(), 2);
    }
}
