use std::path::{Path, PathBuf};

use log::debug;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cryptography::{decrypt_record, encrypt_record, nudge, Key, ZERO_NONCE};
use crate::error::{Error, Result};
use crate::framing::{write_record, RecordReader};
use crate::messages::TransitAck;
use crate::transit::Transit;
use crate::CHUNK_SIZE;

/// Stream a source through the elected endpoint as encrypted records.
///
/// Chunks of at most 4096 plaintext bytes are encrypted under the sender
/// record key with an incrementing nonce and written as length-prefixed
/// frames, while a running SHA-256 of the plaintext accumulates. After the
/// last byte, the peer's encrypted ack is awaited and its digest checked
/// against ours. Returns the confirmed digest.
pub async fn send_records<R>(transit: Transit, source: R) -> Result<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Transit { endpoint, keys } = transit;
    let (read_half, write_half) = endpoint.stream.into_split();

    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    let encrypt_handle = tokio::spawn(chunk_and_encrypt_task(source, keys.sender_record, tx));
    let write_handle = tokio::spawn(write_task(write_half, rx));

    // wait for the network side first: if it fails, its error is the real one
    if let Err(e) = join_task(write_handle).await {
        let _ = encrypt_handle.await;
        return Err(e);
    }
    let digest = join_task(encrypt_handle).await?;

    // final ack from the receiver, encrypted the other way at nonce 0
    let mut reader = RecordReader::new(read_half);
    let record = reader.next_record().await?;
    let (nonce, plaintext) = decrypt_record(&keys.receiver_record, &record)?;
    if nonce != ZERO_NONCE {
        return Err(Error::UnexpectedMessage("final ack at nonzero nonce".into()));
    }
    let ack: TransitAck = serde_json::from_slice(&plaintext)?;
    if ack.ack != "ok" {
        return Err(Error::UnexpectedMessage(format!(
            "final ack said {:?}",
            ack.ack
        )));
    }
    if ack.sha256 != digest {
        return Err(Error::DigestMismatch {
            expected: digest,
            got: ack.sha256,
        });
    }
    debug!("peer confirmed digest {}", digest);
    Ok(digest)
}

/// Receive `filesize` plaintext bytes from the elected endpoint into `dest`.
///
/// Records are decrypted under the sender record key, hashed, and written to
/// a hidden temp file next to the destination; the temp file is renamed into
/// place only once every byte has arrived intact, and discarded on any
/// failure. The computed digest goes back to the sender as one encrypted
/// record at nonce 0. Returns the digest.
pub async fn receive_records(transit: Transit, filesize: u64, dest: &Path) -> Result<String> {
    let Transit { endpoint, keys } = transit;
    let (read_half, mut write_half) = endpoint.stream.into_split();

    let staged = staged_path(dest)?;
    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    let receive_handle = tokio::spawn(receive_and_decrypt_task(
        read_half,
        keys.sender_record,
        filesize,
        tx,
    ));
    let write_handle = tokio::spawn(write_staged_task(staged.clone(), rx));

    let received = join_task(receive_handle).await;
    let written = join_task(write_handle).await;

    if received.is_err() || written.is_err() {
        let _ = fs::remove_file(&staged).await;
    }
    let digest = match (received, written) {
        // a sink failure cancels the network side; report the root cause
        (Err(Error::Cancelled), Err(sink)) => return Err(sink),
        (Err(net), _) => return Err(net),
        (_, Err(sink)) => return Err(sink),
        (Ok(digest), Ok(())) => digest,
    };

    // the transfer is complete: publish the file, then confirm with the digest
    fs::rename(&staged, dest).await?;

    let ack = TransitAck {
        ack: "ok".into(),
        sha256: digest.clone(),
    };
    let record = encrypt_record(&keys.receiver_record, &ZERO_NONCE, &serde_json::to_vec(&ack)?);
    write_record(&mut write_half, &record).await?;
    debug!("sent final ack with digest {}", digest);
    Ok(digest)
}

async fn join_task<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(|_| Error::Cancelled)?
}

/// Read the source in chunks, encrypt each under an incrementing nonce, and
/// hand the records to the write task.
async fn chunk_and_encrypt_task<R: AsyncRead + Unpin>(
    mut source: R,
    key: Key,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<String> {
    let mut nonce = ZERO_NONCE;
    let mut hasher = Sha256::default();
    let mut chunk_count: u64 = 0;

    loop {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let bytes_read = source.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        buffer.truncate(bytes_read);
        hasher.update(&buffer);

        let record = encrypt_record(&key, &nonce, &buffer);
        if tx.send(record).await.is_err() {
            // the write side is gone; its error carries the cause
            return Err(Error::Cancelled);
        }
        nudge(&mut nonce);
        chunk_count += 1;
    }

    debug!("encrypted {} chunk(s)", chunk_count);
    Ok(hex::encode(hasher.finalize()))
}

/// Drain records from the channel onto the wire.
async fn write_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) -> Result<()> {
    while let Some(record) = rx.recv().await {
        write_record(&mut write_half, &record).await?;
    }
    Ok(())
}

/// Read and decrypt records until the byte budget is spent, handing the
/// plaintext to the sink task. The nonce is recovered from each record's
/// prefix rather than tracked separately.
async fn receive_and_decrypt_task(
    read_half: OwnedReadHalf,
    key: Key,
    filesize: u64,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<String> {
    let mut reader = RecordReader::new(read_half);
    let mut hasher = Sha256::default();
    let mut remaining = filesize;

    while remaining > 0 {
        let record = reader.next_record().await?;
        let (_nonce, plaintext) = decrypt_record(&key, &record)?;
        hasher.update(&plaintext);
        remaining = remaining.saturating_sub(plaintext.len() as u64);

        if tx.send(plaintext).await.is_err() {
            return Err(Error::Cancelled);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Append plaintext chunks to the staged temp file.
async fn write_staged_task(staged: PathBuf, mut rx: mpsc::Receiver<Vec<u8>>) -> Result<()> {
    let mut file = fs::File::create(&staged).await?;
    let mut total: u64 = 0;
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    debug!("staged {} bytes at {}", total, staged.display());
    Ok(())
}

/// Hidden temp file in the destination directory, renamed over `dest` once
/// the transfer checks out.
fn staged_path(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "destination has no filename",
            ))
        })?;
    let suffix: u32 = rand::thread_rng().gen();
    Ok(dest.with_file_name(format!(".{}.{:08x}.part", name, suffix)))
}
