use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::MAX_RECORD_SIZE;

/// Incremental decoder for length-prefixed records.
///
/// TCP delivers arbitrary chunk sizes; the decoder buffers whatever arrives
/// and yields complete records once the 4-byte big-endian length header and
/// payload are both available. Leftover bytes stay buffered for the next
/// record.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_record: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_record(MAX_RECORD_SIZE)
    }

    /// The length cap rejects hostile length headers before any allocation.
    pub fn with_max_record(max_record: usize) -> Self {
        FrameDecoder {
            buffer: Vec::new(),
            max_record,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete record, or `None` if more bytes are needed.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > self.max_record {
            return Err(Error::RecordTooLarge {
                len,
                max: self.max_record,
            });
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let record = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Ok(Some(record))
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Async record source: a byte stream fed through a [`FrameDecoder`].
pub struct RecordReader<R> {
    stream: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(stream: R) -> Self {
        RecordReader {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Read the next record, pulling from the stream as needed.
    ///
    /// A clean close mid-header or mid-payload is an `UnexpectedEof`.
    pub async fn next_record(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(record) = self.decoder.next_record()? {
                return Ok(record);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
            self.decoder.feed(&chunk[..n]);
        }
    }
}

/// Write one record as `BE32 length || payload` and flush.
pub async fn write_record<W: AsyncWrite + Unpin>(stream: &mut W, record: &[u8]) -> Result<()> {
    stream.write_u32(record.len() as u32).await?;
    stream.write_all(record).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_single_record() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame(b"hello"));

        assert_eq!(decoder.next_record().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(decoder.next_record().unwrap(), None);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_empty_record() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame(b""));
        assert_eq!(decoder.next_record().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_rechunking_preserves_record_sequence() {
        // any split of the stream must reproduce the original records
        let records: Vec<Vec<u8>> = vec![
            b"first".to_vec(),
            b"".to_vec(),
            vec![0xAB; 300],
            b"last record".to_vec(),
        ];
        let mut stream = Vec::new();
        for record in &records {
            stream.extend_from_slice(&frame(record));
        }

        for chunk_size in [1, 2, 3, 5, 7, 16, 64, stream.len()] {
            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoder.feed(chunk);
                while let Some(record) = decoder.next_record().unwrap() {
                    decoded.push(record);
                }
            }
            assert_eq!(decoded, records, "chunk size {}", chunk_size);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_partial_header_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 0]);
        assert_eq!(decoder.next_record().unwrap(), None);

        decoder.feed(&[0, 3, b'a']);
        assert_eq!(decoder.next_record().unwrap(), None);

        decoder.feed(b"bc");
        assert_eq!(decoder.next_record().unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut decoder = FrameDecoder::with_max_record(1024);
        decoder.feed(&(2048u32).to_be_bytes());

        assert!(matches!(
            decoder.next_record(),
            Err(Error::RecordTooLarge { len: 2048, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_reader_eof_mid_record() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = RecordReader::new(client);

        // announce 10 bytes, deliver 4, then close
        server.write_u32(10).await.unwrap();
        server.write_all(b"part").await.unwrap();
        drop(server);

        assert!(matches!(
            reader.next_record().await,
            Err(Error::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = RecordReader::new(server);

        let mut client = client;
        write_record(&mut client, b"one").await.unwrap();
        write_record(&mut client, &[0u8; 200]).await.unwrap();

        assert_eq!(reader.next_record().await.unwrap(), b"one".to_vec());
        assert_eq!(reader.next_record().await.unwrap(), vec![0u8; 200]);
    }
}
