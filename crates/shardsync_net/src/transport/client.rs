//! Client role: one outbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use super::connection::{self, Connection, ConnectionState, PacketSink};
use super::TransportEngine;
use crate::error::{TransportError, TransportResult};
use crate::protocol::{OutgoingPacket, PacketGroup};

/// An outbound connection owned by a [`TransportEngine`].
#[derive(Debug)]
pub struct Client<S> {
    conn: Arc<Connection<S>>,
}

impl<S: ConnectionState> Client<S> {
    /// Returns the underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection<S>> {
        &self.conn
    }

    /// Closes the connection.
    pub fn close(&self, reason: impl Into<String>) {
        self.conn.close(reason);
    }
}

impl<S: ConnectionState> PacketSink for Client<S> {
    fn send_packet_group(&self, group: &PacketGroup) {
        self.conn.send_packet_group(group);
    }

    fn send_single_packet(&self, packet: &dyn OutgoingPacket) {
        self.conn.send_single_packet(packet);
    }
}

impl<S: ConnectionState> TransportEngine<S> {
    /// Connects to `addr` and starts the connection's tasks.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the connect fails,
    /// [`TransportError::Rejected`] if the session refused the socket, or
    /// [`TransportError::ShutDown`].
    pub fn connect(&mut self, addr: SocketAddr) -> TransportResult<Client<S>> {
        let runtime = self.runtime()?;
        let stream = runtime.block_on(TcpStream::connect(addr))?;
        let conn = connection::open(&self.shared, stream, addr).ok_or(TransportError::Rejected(addr))?;
        Ok(Client { conn })
    }
}
