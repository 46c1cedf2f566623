use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::error::{Error, Result};
use crate::handshake::RELAY_OK;

/// Upper bound on the request line; a legitimate one is 102 bytes.
const REQUEST_LINE_LIMIT: usize = 256;

/// A parsed `please relay` request, ready for pairing.
pub struct RelayRequest {
    pub token: String,
    pub side: String,
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

struct Waiting {
    side: String,
    stream: TcpStream,
    addr: SocketAddr,
}

/// Owns the pairing table: one waiting side per token until its peer shows
/// up, at which point both sockets move to a splice task.
pub struct ConnectionManager {
    pending: HashMap<String, Waiting>,
    receiver_channel: Receiver<RelayRequest>,
}

impl ConnectionManager {
    pub fn new(receiver_channel: Receiver<RelayRequest>) -> Self {
        ConnectionManager {
            pending: HashMap::new(),
            receiver_channel,
        }
    }

    fn pair(&mut self, request: RelayRequest) {
        match self.pending.remove(&request.token) {
            Some(waiting) if waiting.side != request.side => {
                info!(
                    "pairing {} and {} for token {}…",
                    waiting.addr,
                    request.addr,
                    &request.token[..8]
                );
                tokio::spawn(splice(waiting.stream, request.stream));
            }
            Some(stale) => {
                // the same side reconnected; keep the fresh socket
                debug!("replacing stale waiter {} for token", stale.addr);
                self.insert(request);
            }
            None => {
                debug!("side {} waiting for its peer", request.side);
                self.insert(request);
            }
        }
    }

    fn insert(&mut self, request: RelayRequest) {
        self.pending.insert(
            request.token,
            Waiting {
                side: request.side,
                stream: request.stream,
                addr: request.addr,
            },
        );
    }
}

/// Central coordinator task: drains parsed requests off the channel and
/// pairs them.
pub async fn relay_manager(mut manager: ConnectionManager) {
    while let Some(request) = manager.receiver_channel.recv().await {
        manager.pair(request);
    }
}

/// Per-connection handler: read and validate the request line, then hand
/// the socket to the manager. Malformed requests drop the connection.
pub async fn handle_new_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    manager_channel: Sender<RelayRequest>,
) {
    match read_request_line(&mut stream).await {
        Ok((token, side)) => {
            let request = RelayRequest {
                token,
                side,
                stream,
                addr,
            };
            if manager_channel.send(request).await.is_err() {
                warn!("relay manager is gone, dropping {}", addr);
            }
        }
        Err(e) => debug!("rejecting {}: {}", addr, e),
    }
}

/// Accept relay clients forever.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let (sender_channel, receiver_channel) = mpsc::channel::<RelayRequest>(100);
    let manager = ConnectionManager::new(receiver_channel);
    tokio::spawn(relay_manager(manager));

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("relay client connected: {}", addr);
        tokio::spawn(handle_new_connection(stream, addr, sender_channel.clone()));
    }
}

async fn read_request_line(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > REQUEST_LINE_LIMIT {
            return Err(Error::RelayHandshakeFailed);
        }
    }
    let line = std::str::from_utf8(&line).map_err(|_| Error::RelayHandshakeFailed)?;
    parse_request_line(line)
}

fn parse_request_line(line: &str) -> Result<(String, String)> {
    let rest = line
        .strip_prefix("please relay ")
        .ok_or(Error::RelayHandshakeFailed)?;
    let (token, side) = rest
        .split_once(" for side ")
        .ok_or(Error::RelayHandshakeFailed)?;

    if !is_lower_hex(token, 64) || !is_lower_hex(side, 16) {
        return Err(Error::RelayHandshakeFailed);
    }
    Ok((token.to_owned(), side.to_owned()))
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Tell both sides they are paired, then shuttle bytes between them until
/// either end closes.
async fn splice(mut a: TcpStream, mut b: TcpStream) {
    for stream in [&mut a, &mut b] {
        if stream.write_all(RELAY_OK).await.is_err() || stream.flush().await.is_err() {
            return;
        }
    }
    match copy_bidirectional(&mut a, &mut b).await {
        Ok((a_to_b, b_to_a)) => {
            debug!(
                "relay session closed: {} bytes one way, {} the other",
                a_to_b, b_to_a
            )
        }
        Err(e) => debug!("relay session error: {}", e),
    }
}
