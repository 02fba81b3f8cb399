//! The send side of the KRPC socket and transaction ID allocation.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::trace;

use crate::messages::{self, Args, Response};

/// How long the read loop blocks before re-checking for shutdown.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Wraps the UDP socket with message framing and the transaction counter.
///
/// Transaction IDs are 4 little-endian bytes from a counter seeded at a
/// random value. They only need to be unique per destination node within
/// the response window.
#[derive(Debug)]
pub(crate) struct KrpcSocket {
    socket: Arc<UdpSocket>,
    next_tid: u32,
    local_addr: SocketAddr,
}

impl KrpcSocket {
    pub fn bind(address: SocketAddr) -> std::io::Result<KrpcSocket> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let local_addr = socket.local_addr()?;

        Ok(KrpcSocket {
            socket: Arc::new(socket),
            next_tid: rand::thread_rng().gen(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A second handle on the underlying socket for the read loop.
    pub fn reader(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Allocate the next transaction ID.
    pub fn tid(&mut self) -> [u8; 4] {
        self.next_tid = self.next_tid.wrapping_add(1);
        self.next_tid.to_le_bytes()
    }

    /// Send a query under an already-allocated transaction ID. The caller
    /// records the pending query before this transmits.
    pub fn send_query(
        &self,
        addr: SocketAddr,
        transaction_id: &[u8],
        args: &Args,
    ) -> std::io::Result<()> {
        trace!(?addr, method = args.method().as_str(), "tx query");

        let bytes = messages::encode_query(transaction_id, args)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    /// Respond to a query received from `addr`.
    pub fn send_response(
        &self,
        addr: SocketAddr,
        transaction_id: &[u8],
        response: &Response,
    ) -> std::io::Result<()> {
        trace!(?addr, "tx response");

        let bytes = messages::encode_response(transaction_id, response, Some(&addr))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    /// Reply to a query with a wire error frame.
    pub fn send_error(
        &self,
        addr: SocketAddr,
        transaction_id: &[u8],
        error: (i64, &str),
    ) -> std::io::Result<()> {
        trace!(?addr, code = error.0, "tx error");

        let bytes = messages::encode_error(transaction_id, error.0, error.1)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }
}
