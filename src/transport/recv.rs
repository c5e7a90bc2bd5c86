//! Recv transport: two-sided SEND/RECV, no memory exposed to peers. Scales to
//! the largest client counts at the highest per-operation cost.

use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crate::cqp::CompletionQueuePair;
use crate::ctrl::Dialer;
use crate::rdma::cq::WcOpcode;
use crate::rdma::mr::Slicing;
use crate::rdma::nic::Nic;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps};
use crate::wrap::RegisteredMem;

use super::{handshake_qp, ClientId, TransportError, DEFAULT_MAX_IN_FLIGHT};

/// Pack a client id and a buffer id into a single `wr_id`, so that a shared
/// CQP's completions can be attributed back to the scratch buffer that
/// produced them.
fn encode_wr_id(client_id: ClientId, buffer_id: usize) -> u64 {
    ((client_id as u64) << 32) | (buffer_id as u64 & 0xffff_ffff)
}

fn decode_wr_id(wr_id: u64) -> (ClientId, usize) {
    ((wr_id >> 32) as ClientId, (wr_id & 0xffff_ffff) as usize)
}

/// SAFETY: `buf` must hold at least `mem::size_of::<T>()` valid bytes.
unsafe fn read_payload<T: Copy>(buf: *const u8) -> T {
    ptr::read_unaligned(buf as *const T)
}

/// SAFETY: `buf` must point to at least `mem::size_of::<T>()` writable bytes.
unsafe fn write_payload<T: Copy>(buf: *mut u8, value: T) {
    ptr::write_unaligned(buf as *mut T, value);
}

struct ClientSlot<T> {
    qp: Qp,
    cqp: CompletionQueuePair,
    recv_bufs: Vec<RegisteredMem>,
    send_buf: RegisteredMem,
    _marker: PhantomData<T>,
}

/// Recv server: a pre-posted pool of RECV work requests per client, each
/// with its own scratch buffer.
pub struct RecvServer<T> {
    nic: Nic,
    pd: Pd,
    listener: Option<crate::ctrl::Listener>,
    max_concurrency: usize,
    max_in_flight: u32,
    clients: Vec<ClientSlot<T>>,
    next_poll: usize,
}

impl<T: Copy + Send + Sync + 'static> RecvServer<T> {
    /// Equivalent to [`Self::with_max_in_flight`] using
    /// [`DEFAULT_MAX_IN_FLIGHT`].
    pub fn new(connection_string: &str, max_concurrency: usize) -> Result<Self, TransportError> {
        Self::with_max_in_flight(connection_string, max_concurrency, DEFAULT_MAX_IN_FLIGHT)
    }

    /// Probe the default RDMA device and bind the bootstrap listener.
    /// `max_in_flight` bounds the number of RECVs kept posted per client
    /// (`K`), and therefore each client's maximum number of outstanding
    /// unacknowledged SENDs.
    pub fn with_max_in_flight(
        connection_string: &str,
        max_concurrency: usize,
        max_in_flight: u32,
    ) -> Result<Self, TransportError> {
        let nic = Nic::finder()
            .probe()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let pd = Pd::new(&nic.context)?;
        let listener = crate::ctrl::Listener::bind(connection_string)?;
        log::info!(
            "recv server: listening on {connection_string}, {max_in_flight} RECVs/client"
        );
        Ok(Self {
            nic,
            pd,
            listener: Some(listener),
            max_concurrency,
            max_in_flight,
            clients: Vec::with_capacity(max_concurrency),
            next_poll: 0,
        })
    }

    /// Block until the next client connects; establishes its QP and posts
    /// `max_in_flight` RECVs to keep its receive queue replenished.
    pub fn accept(&mut self) -> Result<ClientId, TransportError> {
        if self.clients.len() >= self.max_concurrency {
            return Err(TransportError::AtCapacity(self.max_concurrency));
        }
        let mut bs = self
            .listener
            .as_ref()
            .expect("bootstrap listener already closed")
            .accept()?;
        let port = &self.nic.ports[0];
        let caps = QpCaps {
            max_recv_wr: self.max_in_flight,
            ..QpCaps::default()
        };
        let (qp, cqp) = handshake_qp(&self.pd, port, None, &mut bs, caps, true)?;

        let client_index = self.clients.len();
        let mut recv_bufs = Vec::with_capacity(self.max_in_flight as usize);
        for buf_id in 0..self.max_in_flight as usize {
            let buf = RegisteredMem::new(&self.pd, mem::size_of::<T>().max(1))?;
            qp.recv(&[buf.as_slice()], encode_wr_id(client_index, buf_id))?;
            recv_bufs.push(buf);
        }
        let send_buf = RegisteredMem::new(&self.pd, mem::size_of::<T>().max(1))?;

        log::info!("recv server: accepted client {client_index}");
        self.clients.push(ClientSlot {
            qp,
            cqp,
            recv_bufs,
            send_buf,
            _marker: PhantomData,
        });
        Ok(client_index)
    }

    /// Close the bootstrap listener. Connected clients are unaffected.
    pub fn finish_listen(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.finish_listen();
        }
    }

    /// Busy-poll each client's CQP in round-robin order for a RECV
    /// completion; copies the payload out and reposts the buffer before
    /// returning, preserving the invariant that per-QP outstanding RECVs
    /// never fall behind the client's in-flight SENDs.
    pub fn read(&mut self, out: &mut T) -> Result<ClientId, TransportError> {
        if self.clients.is_empty() {
            return Err(TransportError::Protocol("no clients connected".into()));
        }
        let connected = self.clients.len();
        loop {
            for step in 0..connected {
                let idx = (self.next_poll + step) % connected;
                let client = &mut self.clients[idx];
                if let Some(wr_id) = client.cqp.poll_recv()? {
                    let (_, buffer_id) = decode_wr_id(wr_id);
                    let buf = &client.recv_bufs[buffer_id];
                    // SAFETY: `buf` holds `size_of::<T>()` bytes written by
                    // the peer's SEND that produced this completion.
                    *out = unsafe { read_payload::<T>(buf.addr()) };
                    client.qp.recv(&[buf.as_slice()], wr_id)?;
                    self.next_poll = (idx + 1) % connected;
                    return Ok(idx);
                }
            }
        }
    }

    /// Post a SEND of `msg` on `client_id`'s QP, blocking until it completes.
    pub fn write(&mut self, client_id: ClientId, msg: T) -> Result<(), TransportError> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| TransportError::Protocol(format!("unknown client {client_id}")))?;

        // SAFETY: `send_buf` holds `size_of::<T>()` bytes, exclusively
        // written from this method.
        unsafe { write_payload(client.send_buf.addr(), msg) };
        client
            .qp
            .send(&[client.send_buf.as_slice()], None, None, 0, true, false)?;
        client.cqp.busy_poll_send(Some(WcOpcode::Send))?;
        Ok(())
    }
}

/// Recv client: SENDs requests and keeps a single RECV reposted for
/// responses.
pub struct RecvClient<T> {
    nic: Nic,
    pd: Pd,
    qp: Option<Qp>,
    cqp: Option<CompletionQueuePair>,
    send_buf: Option<RegisteredMem>,
    recv_buf: Option<RegisteredMem>,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send + Sync + 'static> RecvClient<T> {
    /// Probe the default RDMA device. Call [`Self::connect`] before using.
    pub fn new() -> Result<Self, TransportError> {
        let nic = Nic::finder()
            .probe()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let pd = Pd::new(&nic.context)?;
        Ok(Self {
            nic,
            pd,
            qp: None,
            cqp: None,
            send_buf: None,
            recv_buf: None,
            _marker: PhantomData,
        })
    }

    /// Connect to `connection_string` (`"<ip>:<port>"`) and post the first
    /// RECV for the server's response.
    pub fn connect(&mut self, connection_string: &str) -> Result<(), TransportError> {
        let mut bs = Dialer::connect(connection_string)?;
        let port = &self.nic.ports[0];
        let (qp, cqp) = handshake_qp(&self.pd, port, None, &mut bs, QpCaps::default(), false)?;

        let send_buf = RegisteredMem::new(&self.pd, mem::size_of::<T>().max(1))?;
        let recv_buf = RegisteredMem::new(&self.pd, mem::size_of::<T>().max(1))?;
        qp.recv(&[recv_buf.as_slice()], 0)?;

        self.qp = Some(qp);
        self.cqp = Some(cqp);
        self.send_buf = Some(send_buf);
        self.recv_buf = Some(recv_buf);
        log::info!("recv client: connected to {connection_string}");
        Ok(())
    }

    /// SEND `value` to the server, blocking until the send completes.
    pub fn write(&mut self, value: T) -> Result<(), TransportError> {
        let qp = self.qp.as_ref().expect("not connected");
        let cqp = self.cqp.as_ref().expect("not connected");
        let send_buf = self.send_buf.as_ref().expect("not connected");

        // SAFETY: `send_buf` holds `size_of::<T>()` bytes, exclusively
        // written from this method.
        unsafe { write_payload(send_buf.addr(), value) };
        qp.send(&[send_buf.as_slice()], None, None, 0, true, false)?;
        cqp.busy_poll_send(Some(WcOpcode::Send))?;
        Ok(())
    }

    /// Block until the server's response RECV completes; reposts the buffer
    /// for the next call before returning.
    pub fn read(&mut self, out: &mut T) -> Result<(), TransportError> {
        let qp = self.qp.as_ref().expect("not connected");
        let cqp = self.cqp.as_ref().expect("not connected");
        let recv_buf = self.recv_buf.as_ref().expect("not connected");

        let wr_id = cqp.busy_poll_recv()?;
        // SAFETY: `recv_buf` holds `size_of::<T>()` bytes written by the
        // server's SEND that produced this completion.
        *out = unsafe { read_payload::<T>(recv_buf.addr()) };
        qp.recv(&[recv_buf.as_slice()], wr_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wr_id_round_trips_client_and_buffer_id() {
        let wr_id = encode_wr_id(3, 17);
        assert_eq!(decode_wr_id(wr_id), (3, 17));

        let wr_id = encode_wr_id(0, 0);
        assert_eq!(decode_wr_id(wr_id), (0, 0));
    }
}
