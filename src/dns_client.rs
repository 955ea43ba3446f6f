use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use thiserror::Error;

use crate::dns_msg::{self, DnsResponse, WireError};

pub const DNS_PORT: u16 = 53;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUF_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("could not set up the query socket: {0}")]
    Socket(io::Error),
    #[error("failed to send query: {0}")]
    SendFailed(io::Error),
    #[error("no reply from the resolver before the deadline")]
    TimedOut,
    #[error("failed to receive reply: {0}")]
    RecvFailed(io::Error),
}

/// One UDP exchange with one resolver. The socket is owned by the
/// session and closed on every exit path when `run` consumes it.
pub struct QuerySession {
    socket: UdpSocket,
    resolver: SocketAddr,
}

impl QuerySession {
    pub fn new(resolver: SocketAddr, timeout: Duration) -> Result<Self, QueryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(QueryError::Socket)?;
        socket
            .set_read_timeout(Some(timeout))
            .map_err(QueryError::Socket)?;

        Ok(QuerySession { socket, resolver })
    }

    /// Sends one A query for `hostname` and blocks for one reply,
    /// bounded by the session timeout. No retries; the reply's id and
    /// question are not matched against the request.
    pub fn run(self, hostname: &str) -> Result<DnsResponse, QueryError> {
        let query = dns_msg::build_query(rand::random(), hostname)?;
        self.socket
            .send_to(&query, self.resolver)
            .map_err(QueryError::SendFailed)?;

        let mut buf = [0u8; RECV_BUF_SIZE];
        let (len, _) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(QueryError::TimedOut)
            }
            Err(e) => return Err(QueryError::RecvFailed(e)),
        };

        Ok(dns_msg::decode_response(&buf[..len])?)
    }
}
