use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cryptography::Key;
use crate::error::{Error, Result};

pub const GO: &[u8] = b"go\n";
pub const NEVERMIND: &[u8] = b"nevermind\n";
pub const RELAY_OK: &[u8] = b"ok\n";

/// The literal bytes the sender puts on a fresh connection.
pub fn sender_handshake(sender_handshake_key: &Key) -> Vec<u8> {
    format!(
        "transit sender {} ready\n\n",
        hex::encode(sender_handshake_key)
    )
    .into_bytes()
}

/// The literal bytes the receiver puts on a fresh connection.
pub fn receiver_handshake(receiver_handshake_key: &Key) -> Vec<u8> {
    format!(
        "transit receiver {} ready\n\n",
        hex::encode(receiver_handshake_key)
    )
    .into_bytes()
}

/// The line each side sends a relay before the transit handshake.
pub fn relay_handshake(relay_handshake_key: &Key, side: &str) -> Vec<u8> {
    format!(
        "please relay {} for side {}\n",
        hex::encode(relay_handshake_key),
        side
    )
    .into_bytes()
}

/// Send our handshake and read the peer's, concurrently.
///
/// The read is bounded by the exact length of the expected bytes; anything
/// other than those literal bytes fails the candidate with
/// `InvalidHandshake`.
pub async fn exchange(stream: &mut TcpStream, ours: &[u8], expected: &[u8]) -> Result<()> {
    let (mut read_half, mut write_half) = stream.split();

    let send = async {
        write_half.write_all(ours).await?;
        write_half.flush().await
    };
    let receive = async {
        let mut buffer = vec![0u8; expected.len()];
        read_half.read_exact(&mut buffer).await?;
        Ok::<_, std::io::Error>(buffer)
    };

    let (sent, received) = tokio::join!(send, receive);
    sent?;
    let theirs = received.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::InvalidHandshake,
        _ => Error::Io(e),
    })?;

    if theirs != expected {
        return Err(Error::InvalidHandshake);
    }
    Ok(())
}

/// Relay handshake: announce our side, then wait for the relay to report
/// that both sides are present.
pub async fn relay_connect(stream: &mut TcpStream, relay_key: &Key, side: &str) -> Result<()> {
    stream.write_all(&relay_handshake(relay_key, side)).await?;
    stream.flush().await?;

    let mut buffer = [0u8; RELAY_OK.len()];
    stream
        .read_exact(&mut buffer)
        .await
        .map_err(|_| Error::RelayHandshakeFailed)?;
    if buffer != RELAY_OK {
        return Err(Error::RelayHandshakeFailed);
    }
    Ok(())
}

/// Sender side of the arbitration: this candidate won the race.
pub async fn send_go(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(GO).await?;
    stream.flush().await?;
    Ok(())
}

/// Sender side of the arbitration: another candidate won.
pub async fn send_nevermind(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(NEVERMIND).await?;
    stream.flush().await?;
    Ok(())
}

/// Receiver side of the arbitration: the record stream must not start until
/// these exact bytes arrive.
pub async fn expect_go(stream: &mut TcpStream) -> Result<()> {
    let mut buffer = [0u8; GO.len()];
    stream.read_exact(&mut buffer).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::InvalidHandshake,
        _ => Error::Io(e),
    })?;
    if buffer != GO {
        return Err(Error::InvalidHandshake);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::TransitKeys;
    use crate::KEY_SIZE;

    // Literal handshake bytes for an all-zero transit key, cross-checked
    // against the Python magic-wormhole client.
    #[test]
    fn test_handshake_literals_for_zero_key() {
        let keys = TransitKeys::derive(&[0u8; KEY_SIZE]);

        assert_eq!(
            sender_handshake(&keys.sender_handshake),
            b"transit sender fe2c8a176e65d0751b168d0bd10162d51055d3e5af91acac87477230a1caf184 ready\n\n".to_vec()
        );
        assert_eq!(
            receiver_handshake(&keys.receiver_handshake),
            b"transit receiver 9c4914dce9dfa9ffa77cb77b1351832ef966c53376030f980550de5cd79ffba8 ready\n\n".to_vec()
        );
    }

    #[test]
    fn test_relay_handshake_line() {
        let keys = TransitKeys::derive(&[0u8; KEY_SIZE]);
        let line = relay_handshake(&keys.relay_handshake, "0123456789abcdef");

        assert_eq!(
            line,
            b"please relay 432402d3702d5018b755058705b6563ee4046f6056e6d8dad20446b6500b732b for side 0123456789abcdef\n".to_vec()
        );
        assert_eq!(*line.last().unwrap(), b'\n');
    }

    #[tokio::test]
    async fn test_exchange_accepts_expected_bytes() {
        let keys = TransitKeys::derive(&[1u8; KEY_SIZE]);
        let listener = crate::networking::bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let sender_keys = keys.clone();
        let sender = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            exchange(
                &mut stream,
                &sender_handshake(&sender_keys.sender_handshake),
                &receiver_handshake(&sender_keys.receiver_handshake),
            )
            .await
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let receiver = exchange(
            &mut stream,
            &receiver_handshake(&keys.receiver_handshake),
            &sender_handshake(&keys.sender_handshake),
        )
        .await;

        assert!(receiver.is_ok());
        assert!(sender.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_exchange_rejects_wrong_key() {
        let keys = TransitKeys::derive(&[1u8; KEY_SIZE]);
        let wrong = TransitKeys::derive(&[2u8; KEY_SIZE]);
        let listener = crate::networking::bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let sender = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            let _ = exchange(
                &mut stream,
                &sender_handshake(&wrong.sender_handshake),
                &receiver_handshake(&wrong.receiver_handshake),
            )
            .await;
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let result = exchange(
            &mut stream,
            &receiver_handshake(&keys.receiver_handshake),
            &sender_handshake(&keys.sender_handshake),
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidHandshake)));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_go_rejects_nevermind() {
        let listener = crate::networking::bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let loser = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            expect_go(&mut stream).await
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        send_nevermind(&mut stream).await.unwrap();

        assert!(matches!(
            loser.await.unwrap(),
            Err(Error::InvalidHandshake)
        ));
    }
}
