//! Out-of-band TCP bootstrap used to bring up reliable-connected queue pairs
//! and exchange memory region credentials before the RDMA hot path starts.
//!
//! The wire format is a fixed, little-endian binary layout — not
//! length-prefixed or self-describing — so both sides must call the same
//! sequence of `send_*`/`recv_*` methods in the same order.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::rdma::gid::Gid;
use crate::rdma::mr::MrRemote;
use crate::rdma::qp::QpEndpoint;
use crate::rdma::type_alias::*;

/// Errors raised while bootstrapping a connection over the out-of-band TCP
/// socket.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The socket connect/accept/read/write call failed.
    #[error("I/O error during bootstrap")]
    Io(#[from] io::Error),

    /// `connect()` exhausted its retry budget without succeeding.
    #[error("failed to connect after {0} attempts")]
    ConnectRetriesExhausted(u32),

    /// The connection string did not parse as `"<port>"` or `"<ip>:<port>"`.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}

/// Number of connect() retries before giving up.
const CONNECT_MAX_ATTEMPTS: u32 = 1000;

/// Backoff between connect() retries.
const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// An established out-of-band bootstrap channel with a single peer.
///
/// Exclusively used for the handshake; dropped (closing the TCP socket) once
/// the QP and MR credentials have been exchanged and the hot path can begin.
pub struct Bootstrap {
    stream: TcpStream,
}

impl Bootstrap {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send this side's QP endpoint information: 8-byte LID, 8-byte QPN,
    /// 8-byte PSN, 16-byte GID, all little-endian.
    pub fn send_endpoint(&mut self, ep: &QpEndpoint) -> Result<(), BootstrapError> {
        let mut buf = [0u8; 40];
        buf[0..8].copy_from_slice(&(ep.lid as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&(ep.qpn as u64).to_le_bytes());
        // PSN is not carried by `QpEndpoint`; the crate always initialises
        // QPs to the same well-known PSN, but the field is still exchanged
        // on the wire for protocol compatibility with the original design.
        buf[16..24].copy_from_slice(&0u64.to_le_bytes());
        buf[24..40].copy_from_slice(&<[u8; 16]>::from(ep.gid));
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Receive the peer's QP endpoint information: LID, QPN, PSN, and GID.
    ///
    /// The peer's `port_num` is not part of the wire format (each side binds
    /// its own local port independently); callers construct a [`QpEndpoint`]
    /// by pairing this data with their own local port number.
    pub fn recv_endpoint(&mut self) -> Result<(Lid, Qpn, Psn, Gid), BootstrapError> {
        let mut buf = [0u8; 40];
        self.stream.read_exact(&mut buf)?;
        let lid = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as Lid;
        let qpn = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as Qpn;
        let psn = u64::from_le_bytes(buf[16..24].try_into().unwrap()) as Psn;
        let gid: [u8; 16] = buf[24..40].try_into().unwrap();
        Ok((lid, qpn, psn, Gid::from(gid)))
    }

    /// Send a memory region descriptor: 8-byte address, 8-byte length,
    /// 4-byte rkey.
    pub fn send_mr(&mut self, mr: &MrRemote) -> Result<(), BootstrapError> {
        let mut buf = [0u8; 20];
        buf[0..8].copy_from_slice(&mr.addr.to_le_bytes());
        buf[8..16].copy_from_slice(&(mr.len as u64).to_le_bytes());
        buf[16..20].copy_from_slice(&mr.rkey.to_le_bytes());
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Receive a memory region descriptor from the peer.
    pub fn recv_mr(&mut self) -> Result<MrRemote, BootstrapError> {
        let mut buf = [0u8; 20];
        self.stream.read_exact(&mut buf)?;
        let addr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
        let rkey = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        Ok(MrRemote::new(addr, len, rkey))
    }

    /// Send the Doorbell/Distinct-MR slot negotiation fields: 4-byte slot
    /// size, 4-byte client index. Server-to-client only.
    pub fn send_slot_info(&mut self, slot_size: u32, client_index: u32) -> Result<(), BootstrapError> {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&slot_size.to_le_bytes());
        buf[4..8].copy_from_slice(&client_index.to_le_bytes());
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Receive the Doorbell/Distinct-MR slot negotiation fields.
    pub fn recv_slot_info(&mut self) -> Result<(u32, u32), BootstrapError> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf)?;
        let slot_size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let client_index = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok((slot_size, client_index))
    }
}

/// Owns the server's bootstrap listening socket.
///
/// Per connection string: `"<port>"`, binding on all interfaces.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind a new bootstrap listener on the given connection string.
    pub fn bind(connection_string: &str) -> Result<Self, BootstrapError> {
        let port: u16 = connection_string
            .parse()
            .map_err(|_| BootstrapError::InvalidConnectionString(connection_string.to_owned()))?;
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Self { listener })
    }

    /// Block until the next client connects, returning a bootstrap channel
    /// with it.
    pub fn accept(&self) -> Result<Bootstrap, BootstrapError> {
        let (stream, _) = self.listener.accept()?;
        Ok(Bootstrap::new(stream)?)
    }

    /// Close the bootstrap listener. The hot path never uses it again.
    pub fn finish_listen(self) {
        log::debug!("bootstrap listener closed");
        drop(self);
    }
}

/// Client-side connector.
///
/// Per connection string: `"<ip>:<port>"`.
pub struct Dialer;

impl Dialer {
    /// Connect to the server, retrying with a 20ms backoff for up to ~1000
    /// attempts before giving up.
    pub fn connect(connection_string: &str) -> Result<Bootstrap, BootstrapError> {
        let addr = connection_string
            .to_socket_addrs()
            .map_err(|_| BootstrapError::InvalidConnectionString(connection_string.to_owned()))?
            .next()
            .ok_or_else(|| BootstrapError::InvalidConnectionString(connection_string.to_owned()))?;

        for attempt in 0..CONNECT_MAX_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(Bootstrap::new(stream)?),
                Err(e) => {
                    log::debug!(
                        "bootstrap connect attempt {attempt} to {addr} failed: {e}"
                    );
                    std::thread::sleep(CONNECT_BACKOFF);
                }
            }
        }
        Err(BootstrapError::ConnectRetriesExhausted(CONNECT_MAX_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::gid::Gid;
    use crate::rdma::mr::MrRemote;
    use crate::rdma::qp::QpEndpoint;

    /// Two `Bootstrap`s wired together over a loopback TCP socket.
    fn loopback_pair() -> (Bootstrap, Bootstrap) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        let dialed = dial.join().unwrap();
        (
            Bootstrap::new(accepted).unwrap(),
            Bootstrap::new(dialed).unwrap(),
        )
    }

    #[test]
    fn endpoint_round_trips_over_the_wire() {
        let (mut server, mut client) = loopback_pair();
        let ep = QpEndpoint {
            gid: Gid::from([7u8; 16]),
            lid: 42,
            port_num: 1,
            qpn: 0x1234,
        };
        let sender = std::thread::spawn(move || server.send_endpoint(&ep).unwrap());
        let (lid, qpn, _psn, gid) = client.recv_endpoint().unwrap();
        sender.join().unwrap();

        assert_eq!(lid, ep.lid);
        assert_eq!(qpn, ep.qpn);
        assert_eq!(<[u8; 16]>::from(gid), <[u8; 16]>::from(ep.gid));
    }

    #[test]
    fn mr_round_trips_over_the_wire() {
        let (mut server, mut client) = loopback_pair();
        let mr = MrRemote::new(0xdead_beef_u64, 4096, 0x1234);
        let sender = std::thread::spawn(move || server.send_mr(&mr).unwrap());
        let got = client.recv_mr().unwrap();
        sender.join().unwrap();

        assert_eq!(got.addr, mr.addr);
        assert_eq!(got.len, mr.len);
        assert_eq!(got.rkey, mr.rkey);
    }

    #[test]
    fn slot_info_round_trips_over_the_wire() {
        let (mut server, mut client) = loopback_pair();
        let sender = std::thread::spawn(move || server.send_slot_info(256, 7).unwrap());
        let (slot_size, client_index) = client.recv_slot_info().unwrap();
        sender.join().unwrap();

        assert_eq!(slot_size, 256);
        assert_eq!(client_index, 7);
    }
}
