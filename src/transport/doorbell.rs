//! Doorbell transport: the server registers a single shared inbound MR
//! (partitioned into one slot per client) instead of one MR per client,
//! trading per-client registration cost for a round-robin poll whose cost
//! scales with the connected client count.

use std::marker::PhantomData;

use crate::cqp::CompletionQueuePair;
use crate::ctrl::Dialer;
use crate::rdma::cq::WcOpcode;
use crate::rdma::mr::{MrRemote, Slicing};
use crate::rdma::nic::Nic;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps};
use crate::wrap::RegisteredMem;

use super::{handshake_qp, next_seq, round_up_16, ClientId, Slot, TransportError};

struct ClientSlot<T> {
    qp: Qp,
    cqp: CompletionQueuePair,
    /// The client's own recv MR, as advertised at connect time.
    client_recv: MrRemote,
    send_seq: u64,
    _marker: PhantomData<T>,
}

/// Doorbell server: one shared, slot-partitioned MR for all clients' inbound
/// messages, and one shared staging buffer for outbound messages.
pub struct DoorbellServer<T> {
    nic: Nic,
    pd: Pd,
    listener: Option<crate::ctrl::Listener>,
    max_concurrency: usize,
    num_slots: usize,
    inbound: RegisteredMem,
    outbound: RegisteredMem,
    clients: Vec<ClientSlot<T>>,
    next_poll: usize,
}

impl<T: Copy + Send + Sync + 'static> DoorbellServer<T> {
    /// Probe the default RDMA device, bind the bootstrap listener, and
    /// register the shared inbound/outbound MRs.
    ///
    /// The requested `max_concurrency` is rounded up to the next multiple of
    /// 16 when sizing the shared MRs; `accept()` still rejects a (max_concurrency + 1)-th
    /// client.
    pub fn new(connection_string: &str, max_concurrency: usize) -> Result<Self, TransportError> {
        let nic = Nic::finder()
            .probe()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let pd = Pd::new(&nic.context)?;
        let listener = crate::ctrl::Listener::bind(connection_string)?;

        let num_slots = round_up_16(max_concurrency.max(1));
        let inbound = RegisteredMem::new(&pd, num_slots * Slot::<T>::SIZE)?;
        let outbound = RegisteredMem::new(&pd, num_slots * Slot::<T>::SIZE)?;

        log::info!(
            "doorbell server: listening on {connection_string}, {num_slots} slots \
             ({max_concurrency} requested)"
        );
        Ok(Self {
            nic,
            pd,
            listener: Some(listener),
            max_concurrency,
            num_slots,
            inbound,
            outbound,
            clients: Vec::with_capacity(max_concurrency),
            next_poll: 0,
        })
    }

    /// Block until the next client connects. The client's dense id also
    /// selects its slot in the shared inbound/outbound MRs.
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

        let client_index = self.clients.len();
        let slot_remote = self
            .inbound
            .mr()
            .as_remote()
            .slice(client_index * Slot::<T>::SIZE, Slot::<T>::SIZE)
            .expect("slot offset within the registered inbound MR");
        bs.send_mr(&slot_remote)?;
        bs.send_slot_info(Slot::<T>::SIZE as u32, client_index as u32)?;
        let client_recv = bs.recv_mr()?;

        log::info!("doorbell server: accepted client {client_index} (slot {client_index})");
        self.clients.push(ClientSlot {
            qp,
            cqp,
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

    /// Sweep the shared inbound MR's doorbells in round-robin order,
    /// starting from the slot after the last one served, for fairness.
    pub fn read(&mut self, out: &mut T) -> Result<ClientId, TransportError> {
        if self.clients.is_empty() {
            return Err(TransportError::Protocol("no clients connected".into()));
        }
        let connected = self.clients.len();
        loop {
            for step in 0..connected {
                let idx = (self.next_poll + step) % connected;
                // SAFETY: slot `idx` is within the registered inbound MR and
                // is written only by client `idx`.
                let slot_addr = unsafe { self.inbound.addr().add(idx * Slot::<T>::SIZE) };
                let validity = unsafe { Slot::<T>::peek_validity(slot_addr) };
                if validity != 0 {
                    *out = unsafe { Slot::<T>::take(slot_addr) };
                    self.next_poll = (idx + 1) % connected;
                    return Ok(idx);
                }
            }
        }
    }

    /// Stage `msg` in `client_id`'s outbound slot and RDMA-WRITE it to the
    /// client's recv MR, blocking until the write completes.
    pub fn write(&mut self, client_id: ClientId, msg: T) -> Result<(), TransportError> {
        let client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| TransportError::Protocol(format!("unknown client {client_id}")))?;

        let seq = next_seq(&mut client.send_seq);
        let offset = client_id * Slot::<T>::SIZE;
        // SAFETY: slot `client_id` is within the registered outbound MR and
        // is written only from this method.
        unsafe { Slot::<T>::write_at(self.outbound.addr().add(offset), msg, seq) };

        let local = self
            .outbound
            .slice(offset, Slot::<T>::SIZE)
            .expect("offset computed from num_slots bound");
        client.qp.write(&[local], &client.client_recv, 0, None, true)?;
        client.cqp.busy_poll_send(Some(WcOpcode::RdmaWrite))?;
        Ok(())
    }
}

/// Doorbell client: writes into its assigned slot of the server's shared
/// inbound MR, and exposes a dedicated recv MR for the server to WRITE back.
pub struct DoorbellClient<T> {
    nic: Nic,
    pd: Pd,
    qp: Option<Qp>,
    cqp: Option<CompletionQueuePair>,
    send_mem: Option<RegisteredMem>,
    recv_mem: Option<RegisteredMem>,
    server_slot: Option<MrRemote>,
    send_seq: u64,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send + Sync + 'static> DoorbellClient<T> {
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
            server_slot: None,
            send_seq: 0,
            _marker: PhantomData,
        })
    }

    /// Connect to `connection_string` (`"<ip>:<port>"`).
    pub fn connect(&mut self, connection_string: &str) -> Result<(), TransportError> {
        let mut bs = Dialer::connect(connection_string)?;
        let port = &self.nic.ports[0];
        let (qp, cqp) = handshake_qp(&self.pd, port, None, &mut bs, QpCaps::default(), false)?;

        let server_slot = bs.recv_mr()?;
        let (_slot_size, _client_index) = bs.recv_slot_info()?;

        let send_mem = RegisteredMem::new(&self.pd, Slot::<T>::SIZE)?;
        let recv_mem = RegisteredMem::new(&self.pd, Slot::<T>::SIZE)?;
        bs.send_mr(&recv_mem.mr().as_remote())?;

        self.qp = Some(qp);
        self.cqp = Some(cqp);
        self.send_mem = Some(send_mem);
        self.recv_mem = Some(recv_mem);
        self.server_slot = Some(server_slot);
        log::info!("doorbell client: connected to {connection_string}");
        Ok(())
    }

    /// Write `value` into its assigned slot of the server's shared inbound
    /// MR, blocking until the write completes.
    pub fn write(&mut self, value: T) -> Result<(), TransportError> {
        let seq = next_seq(&mut self.send_seq);
        let qp = self.qp.as_ref().expect("not connected");
        let cqp = self.cqp.as_ref().expect("not connected");
        let send_mem = self.send_mem.as_ref().expect("not connected");
        let server_slot = self.server_slot.as_ref().expect("not connected");

        // SAFETY: `send_mem` is a registered MR of size `Slot::<T>::SIZE`,
        // exclusively written from this method.
        unsafe { Slot::<T>::write_at(send_mem.addr(), value, seq) };

        qp.write(&[send_mem.as_slice()], server_slot, 0, None, true)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    /// Round-robin fairness: `read` should visit slots in order starting
    /// from the successor of the last slot it served, wrapping around.
    #[test]
    fn round_robin_order_wraps() {
        let connected = 4usize;
        let mut next_poll = 2usize;
        let mut visit_order = Vec::new();
        for step in 0..connected {
            visit_order.push((next_poll + step) % connected);
        }
        assert_eq!(visit_order, vec![2, 3, 0, 1]);
        next_poll = (visit_order[1] + 1) % connected;
        assert_eq!(next_poll, 0);
    }
}
