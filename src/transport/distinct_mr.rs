//! Distinct-MR transport: each connected client owns a dedicated inbox and
//! outbox memory region on the server, addressed directly by RDMA WRITE.

use std::marker::PhantomData;

use crate::cqp::CompletionQueuePair;
use crate::ctrl::{Dialer, Listener};
use crate::rdma::cq::WcOpcode;
use crate::rdma::mr::{MrRemote, Slicing};
use crate::rdma::nic::Nic;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps};
use crate::wrap::RegisteredMem;

use super::{handshake_qp, next_seq, ClientId, Slot, TransportError};

struct ClientSlot<T> {
    qp: Qp,
    cqp: CompletionQueuePair,
    /// Written by the client via RDMA WRITE, polled by the server.
    inbox: RegisteredMem,
    /// Staged by the server before an RDMA WRITE to the client's recv MR.
    outbox: RegisteredMem,
    /// The client's recv MR, as advertised at connect time.
    client_recv: MrRemote,
    send_seq: u64,
    _marker: PhantomData<T>,
}

/// Distinct-MR server: exposes one inbox/outbox MR pair per connected client.
pub struct DistinctMrServer<T> {
    nic: Nic,
    pd: Pd,
    listener: Option<Listener>,
    max_concurrency: usize,
    clients: Vec<ClientSlot<T>>,
    next_poll: usize,
}

impl<T: Copy + Send + Sync + 'static> DistinctMrServer<T> {
    /// Probe the default RDMA device and bind the bootstrap listener on
    /// `connection_string` (`"<port>"`).
    pub fn new(connection_string: &str, max_concurrency: usize) -> Result<Self, TransportError> {
        let nic = Nic::finder()
            .probe()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let pd = Pd::new(&nic.context)?;
        let listener = Listener::bind(connection_string)?;
        log::info!("distinct-mr server: listening on {connection_string}");
        Ok(Self {
            nic,
            pd,
            listener: Some(listener),
            max_concurrency,
            clients: Vec::with_capacity(max_concurrency),
            next_poll: 0,
        })
    }

    /// Block until the next client connects; establishes its QP, registers
    /// its inbox/outbox MRs, and exchanges credentials over the bootstrap
    /// socket. Returns the new client's dense id.
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
        let (qp, cqp) = handshake_qp(&self.pd, port, None, &mut bs, QpCaps::default(), true)?;

        let inbox = RegisteredMem::new(&self.pd, Slot::<T>::SIZE)?;
        let outbox = RegisteredMem::new(&self.pd, Slot::<T>::SIZE)?;

        let client_index = self.clients.len();
        bs.send_mr(&inbox.mr().as_remote())?;
        bs.send_slot_info(Slot::<T>::SIZE as u32, client_index as u32)?;
        let client_recv = bs.recv_mr()?;

        log::info!("distinct-mr server: accepted client {client_index}");
        self.clients.push(ClientSlot {
            qp,
            cqp,
            inbox,
            outbox,
            client_recv,
            send_seq: 0,
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

    /// Round-robin scan for the first client with a pending message.
    /// Blocks (busy-polling) until one is found.
    pub fn read(&mut self, out: &mut T) -> Result<ClientId, TransportError> {
        if self.clients.is_empty() {
            return Err(TransportError::Protocol("no clients connected".into()));
        }
        loop {
            for step in 0..self.clients.len() {
                let idx = (self.next_poll + step) % self.clients.len();
                let client = &mut self.clients[idx];
                // SAFETY: `inbox` is a registered MR of size `Slot::<T>::SIZE`,
                // exclusively polled from this method.
                let validity = unsafe { Slot::<T>::peek_validity(client.inbox.addr()) };
                if validity != 0 {
                    *out = unsafe { Slot::<T>::take(client.inbox.addr()) };
                    self.next_poll = (idx + 1) % self.clients.len();
                    return Ok(idx);
                }
            }
        }
    }

    /// Write `msg` into `client_id`'s outbox and RDMA-WRITE it into the
    /// client's recv MR, blocking until the write completes.
    pub fn write(&mut self, client_id: ClientId, msg: T) -> Result<(), TransportError> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| TransportError::Protocol(format!("unknown client {client_id}")))?;

        let seq = next_seq(&mut client.send_seq);
        // SAFETY: `outbox` is a registered MR of size `Slot::<T>::SIZE`,
        // exclusively written from this method.
        unsafe { Slot::<T>::write_at(client.outbox.addr(), msg, seq) };

        client
            .qp
            .write(&[client.outbox.as_slice()], &client.client_recv, 0, None, true)?;
        client.cqp.busy_poll_send(Some(WcOpcode::RdmaWrite))?;
        Ok(())
    }
}

/// Distinct-MR client: one dedicated send MR (target: the server's inbox)
/// and one dedicated recv MR (target of the server's WRITE-back).
pub struct DistinctMrClient<T> {
    nic: Nic,
    pd: Pd,
    qp: Option<Qp>,
    cqp: Option<CompletionQueuePair>,
    send_mem: Option<RegisteredMem>,
    recv_mem: Option<RegisteredMem>,
    server_inbox: Option<MrRemote>,
    send_seq: u64,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send + Sync + 'static> DistinctMrClient<T> {
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
            send_mem: None,
            recv_mem: None,
            server_inbox: None,
            send_seq: 0,
            _marker: PhantomData,
        })
    }

    /// Connect to `connection_string` (`"<ip>:<port>"`), retrying with a
    /// 20ms backoff for up to ~1000 attempts.
    pub fn connect(&mut self, connection_string: &str) -> Result<(), TransportError> {
        let mut bs = Dialer::connect(connection_string)?;
        let port = &self.nic.ports[0];
        let (qp, cqp) = handshake_qp(&self.pd, port, None, &mut bs, QpCaps::default(), false)?;

        let server_inbox = bs.recv_mr()?;
        let (_slot_size, _client_index) = bs.recv_slot_info()?;

        let send_mem = RegisteredMem::new(&self.pd, Slot::<T>::SIZE)?;
        let recv_mem = RegisteredMem::new(&self.pd, Slot::<T>::SIZE)?;
        bs.send_mr(&recv_mem.mr().as_remote())?;

        self.qp = Some(qp);
        self.cqp = Some(cqp);
        self.send_mem = Some(send_mem);
        self.recv_mem = Some(recv_mem);
        self.server_inbox = Some(server_inbox);
        log::info!("distinct-mr client: connected to {connection_string}");
        Ok(())
    }

    fn connected_bootstrap_bundle(
        &self,
    ) -> (&Qp, &CompletionQueuePair, &RegisteredMem, &MrRemote) {
        (
            self.qp.as_ref().expect("not connected"),
            self.cqp.as_ref().expect("not connected"),
            self.send_mem.as_ref().expect("not connected"),
            self.server_inbox.as_ref().expect("not connected"),
        )
    }

    /// Write `value` into the local send MR and RDMA-WRITE it to the
    /// server's inbox, blocking until the write completes.
    pub fn write(&mut self, value: T) -> Result<(), TransportError> {
        let seq = next_seq(&mut self.send_seq);
        let (qp, cqp, send_mem, server_inbox) = self.connected_bootstrap_bundle();

        // SAFETY: `send_mem` is a registered MR of size `Slot::<T>::SIZE`,
        // exclusively written from this method.
        unsafe { Slot::<T>::write_at(send_mem.addr(), value, seq) };

        qp.write(&[send_mem.as_slice()], server_inbox, 0, None, true)?;
        cqp.busy_poll_send(Some(WcOpcode::RdmaWrite))?;
        Ok(())
    }

    /// Busy-poll the local recv MR until the server's response lands.
    pub fn read(&mut self, out: &mut T) -> Result<(), TransportError> {
        let recv_mem = self.recv_mem.as_ref().expect("not connected");
        loop {
            // SAFETY: `recv_mem` is a registered MR of size `Slot::<T>::SIZE`,
            // exclusively polled from this method.
            let validity = unsafe { Slot::<T>::peek_validity(recv_mem.addr()) };
            if validity != 0 {
                *out = unsafe { Slot::<T>::take(recv_mem.addr()) };
                return Ok(());
            }
        }
    }
}
