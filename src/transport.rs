
//! Byte transport seam of the mount driver
//!
//! The multiplexer does not care what carries its bytes: anything that can
//! deliver blocks off a reliable stream and accept whole-block writes will
//! do. `StreamTransport` adapts any tokio byte stream (TCP, Unix socket,
//! in-memory duplex) to this interface.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

/// Block-oriented bidirectional byte transport to a 9P server
///
/// A hung-up peer is reported as `Error::Hungup`, never as an empty block.
///
/// `bread` must be cancellation safe: when the returned future is dropped
/// before completion, no bytes may have been consumed from the stream. The
/// transport reader relies on this to hand the reader role to another
/// caller after an interrupt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one block of at most `maxlen` bytes
    async fn bread(&self, maxlen: u32) -> Result<Bytes>;

    /// Write the block out in its entirety, returning its length
    async fn bwrite(&self, b: Bytes) -> Result<usize>;
}

/// `Transport` adapter over any tokio byte stream
pub struct StreamTransport<T> {
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
}

impl<T: AsyncRead + AsyncWrite + Send> StreamTransport<T> {
    pub fn new(stream: T) -> StreamTransport<T> {
        let (reader, writer) = split(stream);
        StreamTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

fn hangup(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => Error::Hungup,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for StreamTransport<T> {
    async fn bread(&self, maxlen: u32) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(maxlen as usize);
        // read_buf is cancellation safe, which keeps the block queue
        // consistent when an interrupted reader abandons this call
        let n = reader.read_buf(&mut buf).await.map_err(hangup)?;
        if n == 0 {
            return Err(Error::Hungup);
        }
        Ok(buf.freeze())
    }

    async fn bwrite(&self, b: Bytes) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&b).await.map_err(hangup)?;
        writer.flush().await.map_err(hangup)?;
        Ok(b.len())
    }
}

/// Interrupt token of a caller task
///
/// Blocking points inside the multiplexer watch the token they were handed;
/// `interrupt()` from any other task wakes the caller there, which converts
/// the cancellation into the Tflush protocol. Interrupts are counted, not
/// latched, so the flush handshake itself can be interrupted a second time
/// to abandon it.
///
/// A token belongs to a single caller task: only one task may block on it
/// at a time.
pub struct Intr {
    n: AtomicU64,
    z: Notify,
}

impl Intr {
    pub fn new() -> Intr {
        Intr {
            n: AtomicU64::new(0),
            z: Notify::new(),
        }
    }

    /// Interrupt the caller at its next blocking point
    pub fn interrupt(&self) {
        self.n.fetch_add(1, Ordering::SeqCst);
        self.z.notify_one();
    }

    /// Number of interrupts posted so far
    pub fn count(&self) -> u64 {
        self.n.load(Ordering::SeqCst)
    }

    /// Resolve once more interrupts than `seen` have been posted
    pub(crate) async fn wait(&self, seen: u64) {
        while self.count() <= seen {
            self.z.notified().await;
        }
    }
}

impl Default for Intr {
    fn default() -> Self {
        Intr::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn bread_returns_written_block() {
        let (client, mut server) = tokio::io::duplex(4096);
        let trans = StreamTransport::new(client);

        server.write_all(b"hello").await.unwrap();
        let b = trans.bread(4096).await.unwrap();
        assert_eq!(&b[..], b"hello");

        trans.bwrite(Bytes::from_static(b"back")).await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn bread_reports_hangup_on_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let trans = StreamTransport::new(client);
        drop(server);

        match trans.bread(4096).await {
            Err(Error::Hungup) => {}
            other => panic!("expected hangup, got {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn interrupt_wakes_waiter() {
        let intr = Arc::new(Intr::new());
        let seen = intr.count();

        let waiter = {
            let intr = intr.clone();
            tokio::spawn(async move { intr.wait(seen).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        intr.interrupt();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intr.count(), seen + 1);
    }
}
