//! Frame transport: one OBEX frame at a time over any async byte stream,
//! with close/cancel triggers and an optional per-read timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use obex_core::protocol::PREAMBLE_LEN;
use obex_core::wire::frame_len;
use obex_core::{ObexError, RawFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// One-shot, cloneable signal. Once fired it stays fired.
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true for the call that actually fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once fired (immediately if it already was).
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Opens streams to a peer.
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// OBEX over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<RawFrame, ObexError> {
    let mut preamble = [0u8; PREAMBLE_LEN];
    stream.read_exact(&mut preamble).await?;
    let len = frame_len(&preamble)?;
    let mut bytes = vec![0u8; len];
    bytes[..PREAMBLE_LEN].copy_from_slice(&preamble);
    stream.read_exact(&mut bytes[PREAMBLE_LEN..]).await?;
    Ok(RawFrame::from_bytes(bytes))
}

/// Frame-level reader/writer shared by client and server sessions.
pub struct FrameIo<S> {
    stream: Option<S>,
    closer: Trigger,
    cancel: Trigger,
    timeout: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameIo<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            closer: Trigger::new(),
            cancel: Trigger::new(),
            timeout: None,
        }
    }

    /// Reads that take longer fail with `Cancelled`.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Firing this makes pending and future reads fail with `ConnectionClosed`.
    pub fn close_handle(&self) -> Trigger {
        self.closer.clone()
    }

    /// Firing this makes pending and future reads fail with `Cancelled`.
    pub fn cancel_handle(&self) -> Trigger {
        self.cancel.clone()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some() && !self.closer.is_fired()
    }

    fn stream(&mut self) -> Result<&mut S, ObexError> {
        if self.closer.is_fired() {
            return Err(ObexError::ConnectionClosed);
        }
        self.stream.as_mut().ok_or(ObexError::ConnectionClosed)
    }

    pub async fn send(&mut self, frame: &[u8]) -> Result<(), ObexError> {
        let stream = self.stream()?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        tracing::debug!(code = frame.first().copied().unwrap_or(0), len = frame.len(), "sent frame");
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<RawFrame, ObexError> {
        let closer = self.closer.clone();
        let cancel = self.cancel.clone();
        let timeout = self.timeout;
        if cancel.is_fired() {
            return Err(ObexError::Cancelled);
        }
        let stream = self.stream()?;
        let expired = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        let frame = tokio::select! {
            biased;
            _ = closer.fired() => Err(ObexError::ConnectionClosed),
            _ = cancel.fired() => Err(ObexError::Cancelled),
            _ = expired => Err(ObexError::Cancelled),
            read = read_frame(stream) => read,
        }?;
        tracing::debug!(code = frame.code(), len = frame.len(), "received frame");
        Ok(frame)
    }

    /// Idempotent. The open flag is cleared (and readers woken) before the stream is shut down.
    pub async fn close(&mut self) {
        self.closer.fire();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "stream shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obex_core::{encode_request, HeaderSet, Opcode};
    use tokio::io::duplex;

    fn sample_frame() -> Vec<u8> {
        let mut hs = HeaderSet::new();
        hs.set_name("x.txt");
        encode_request(Opcode::PutFinal, &[], Some(1), &hs).unwrap()
    }

    #[test]
    fn trigger_fires_once() {
        let t = Trigger::new();
        assert!(!t.is_fired());
        assert!(t.fire());
        assert!(!t.clone().fire());
        assert!(t.is_fired());
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (a, b) = duplex(1024);
        let mut tx = FrameIo::new(a);
        let mut rx = FrameIo::new(b);
        let frame = sample_frame();
        tx.send(&frame).await.unwrap();
        tx.send(&frame).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().as_bytes(), &frame[..]);
        assert_eq!(rx.recv().await.unwrap().as_bytes(), &frame[..]);
    }

    #[tokio::test]
    async fn close_while_blocked_in_recv() {
        let (_a, b) = duplex(64);
        let mut rx = FrameIo::new(b);
        let closer = rx.close_handle();
        let reader = tokio::spawn(async move {
            let res = rx.recv().await;
            rx.close().await;
            rx.close().await;
            (res, rx.is_open())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.fire();
        let (res, open) = reader.await.unwrap();
        assert!(matches!(res, Err(ObexError::ConnectionClosed)));
        assert!(!open);
    }

    #[tokio::test]
    async fn cancel_interrupts_recv() {
        let (_a, b) = duplex(64);
        let mut rx = FrameIo::new(b);
        let cancel = rx.cancel_handle();
        let reader = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.fire();
        assert!(matches!(reader.await.unwrap(), Err(ObexError::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_is_cancelled() {
        let (_a, b) = duplex(64);
        let mut rx = FrameIo::new(b);
        rx.set_timeout(Some(Duration::from_millis(10)));
        assert!(matches!(rx.recv().await, Err(ObexError::Cancelled)));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_connection_closed() {
        let (mut a, b) = duplex(64);
        let mut rx = FrameIo::new(b);
        a.write_all(&[0x82, 0x00, 0x10, 0x01]).await.unwrap();
        drop(a);
        assert!(matches!(rx.recv().await, Err(ObexError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn short_length_field_is_malformed() {
        let (mut a, b) = duplex(64);
        let mut rx = FrameIo::new(b);
        a.write_all(&[0xA0, 0x00, 0x01]).await.unwrap();
        assert!(matches!(rx.recv().await, Err(ObexError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = duplex(64);
        let mut tx = FrameIo::new(a);
        tx.close().await;
        assert!(matches!(
            tx.send(&sample_frame()).await,
            Err(ObexError::ConnectionClosed)
        ));
    }
}
