//! Client side of one worker connection.
//!
//! Wraps the worker's pipe pair in framed streams and enforces the protocol
//! discipline: frame-atomic writes, single-consumer reads, and strictly
//! serialized request/reply exchanges (no pipelining).

use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FramingError, RpcCodec};
use crate::bridge::protocol::{Request, Response};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Closed locally or torn down after the worker exited. Recoverable:
    /// the caller re-requests a channel and gets a fresh worker.
    #[error("channel closed")]
    Closed,

    /// Frame-level corruption. Fatal to this channel.
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// A live worker connection: framed request writer plus framed response
/// reader, generic over the byte streams so tests can run it over in-memory
/// duplex pipes.
pub struct Channel<R, W> {
    reader: Mutex<Option<FramedRead<R, RpcCodec<Response>>>>,
    writer: Mutex<Option<FramedWrite<W, RpcCodec<Request>>>>,
    exchange: Mutex<()>,
    closed: AtomicBool,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(Some(FramedRead::new(reader, RpcCodec::new()))),
            writer: Mutex::new(Some(FramedWrite::new(writer, RpcCodec::new()))),
            exchange: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes one request frame. The writer lock is held for the whole
    /// frame, so concurrent senders never interleave partial frames.
    pub async fn send(&self, request: &Request) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ChannelError::Closed)?;
        writer.send(request.clone()).await?;
        Ok(())
    }

    /// Reads the next response frame. End-of-stream means the worker went
    /// away mid-conversation and surfaces as a framing error.
    pub async fn recv(&self) -> Result<Response, ChannelError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(ChannelError::Closed)?;
        match reader.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(FramingError::UnexpectedEof.into()),
        }
    }

    /// One request, one blocking reply. A second concurrent exchange on the
    /// same channel waits behind the first rather than pipelining.
    pub async fn exchange(&self, request: &Request) -> Result<Response, ChannelError> {
        let _turn = self.exchange.lock().await;
        self.send(request).await?;
        self.recv().await
    }

    /// Closes both directions. Idempotent; secondary errors are logged and
    /// swallowed because close runs on teardown paths where the worker is
    /// often already gone.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!(error = %e, "Close of write half failed");
            }
        }
        drop(self.reader.lock().await.take());
    }
}
