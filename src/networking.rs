use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::error::Result;
use crate::messages::Hint;
use crate::CONNECT_TIMEOUT_SECS;

/// How an endpoint was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Direct,
    Relay,
}

/// A live duplex TCP endpoint, tagged with how it was reached.
#[derive(Debug)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub stream: TcpStream,
}

pub fn create_reusable_socket(local_addr: SocketAddr) -> Result<TcpSocket> {
    let socket = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local_addr)?;
    Ok(socket)
}

/// Pick an ephemeral TCP port and release it.
///
/// The port is advertised in our direct hints; the listener is re-bound at
/// that port (SO_REUSEADDR makes the re-bind reliable) before the hints go
/// out.
pub fn allocate_tcp_port() -> Result<u16> {
    let socket = create_reusable_socket(SocketAddr::from(([127, 0, 0, 1], 0)))?;
    let port = socket.local_addr()?.port();
    Ok(port)
}

/// Bind the inbound listener on all interfaces at the advertised port.
pub fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = create_reusable_socket(SocketAddr::from(([0, 0, 0, 0], port)))?;
    Ok(socket.listen(1024)?)
}

/// One direct hint per non-loopback IPv4 interface address.
pub fn local_direct_hints(port: u16) -> Result<Vec<Hint>> {
    let mut hints = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        match iface.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() => {
                hints.push(Hint::direct(ip.to_string(), port));
            }
            _ => {}
        }
    }
    debug!("advertising {} direct hint(s) on port {}", hints.len(), port);
    Ok(hints)
}

/// Attempt an outbound TCP connection to a hint, bounded by the connect
/// timeout. Hostnames resolve through the system resolver, so relay hints
/// with DNS names work as well as raw addresses.
pub async fn try_connect(hint: &Hint, kind: EndpointKind) -> Result<Endpoint> {
    let addr = format!("{}:{}", hint.hostname, hint.port);
    debug!("dialing {} ({:?})", addr, kind);

    let stream = timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(addr.as_str()),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )
    })??;

    debug!("connected to {} ({:?})", addr, kind);
    Ok(Endpoint { kind, stream })
}
