use async_trait::async_trait;

use crate::error::Result;
use crate::KEY_SIZE;

/// Boundary to the external rendezvous layer.
///
/// By the time transit starts, the wormhole client has already completed the
/// PAKE exchange; what remains is an ordered, encrypted message channel to
/// the peer plus the agreed session key. Messages are opaque byte payloads,
/// delivered whole and in order.
#[async_trait]
pub trait EncryptedConnection: Send {
    async fn send_plain(&mut self, bytes: &[u8]) -> Result<()>;
    async fn receive_plain(&mut self) -> Result<Vec<u8>>;
    fn shared_key(&self) -> [u8; KEY_SIZE];
}
