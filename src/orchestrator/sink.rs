//! The client side of a streaming response.

use std::convert::Infallible;

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::RelayError;
use crate::protocol::canonical::CanonicalStreamEvent;
use crate::stream::StreamEncoder;

const CHANNEL_CAPACITY: usize = 32;

/// Writes encoded frames to the response body.
///
/// Outlives every attempt of one logical request, so it alone knows whether
/// the client has seen bytes and whether the terminal marker went out.
pub struct ClientSink {
    tx: mpsc::Sender<Bytes>,
    encoder: Box<dyn StreamEncoder>,
    cancel: CancellationToken,
    frames: Vec<Bytes>,
    bytes_sent: bool,
    terminal_sent: bool,
    /// Stops the disconnect watcher once the request is over.
    _watcher: DropGuard,
}

impl ClientSink {
    /// Create a sink and the body stream it feeds. Dropping the body cancels
    /// `cancel`.
    pub fn channel(
        encoder: Box<dyn StreamEncoder>,
        cancel: CancellationToken,
    ) -> (Self, impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let finished = CancellationToken::new();
        spawn_disconnect_watcher(tx.clone(), cancel.clone(), finished.clone());
        let sink = Self {
            tx,
            encoder,
            cancel,
            frames: Vec::with_capacity(8),
            bytes_sent: false,
            terminal_sent: false,
            _watcher: finished.drop_guard(),
        };
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        });
        (sink, body)
    }

    #[must_use]
    pub fn bytes_sent(&self) -> bool {
        self.bytes_sent
    }

    #[must_use]
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    /// Encode and write one event. `Done` writes the terminal marker.
    ///
    /// # Errors
    ///
    /// [`RelayError::Cancelled`] once the client is gone.
    pub async fn send_event(&mut self, event: &CanonicalStreamEvent) -> Result<(), RelayError> {
        if self.terminal_sent {
            return Ok(());
        }
        self.encoder.encode(event, &mut self.frames);
        if matches!(event, CanonicalStreamEvent::Done) {
            self.terminal_sent = true;
        }
        self.flush().await
    }

    /// Write the protocol's error frame in place of the terminal marker.
    /// Does nothing after a terminal marker or a disconnect.
    pub async fn send_error(&mut self, err: &RelayError) {
        if self.terminal_sent || self.cancel.is_cancelled() {
            return;
        }
        self.terminal_sent = true;
        self.encoder.encode_error(err, &mut self.frames);
        if self.flush().await.is_err() {
            tracing::debug!("client left before the error frame was written");
        }
    }

    async fn flush(&mut self) -> Result<(), RelayError> {
        for frame in self.frames.drain(..) {
            if self.cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            if self.tx.send(frame).await.is_err() {
                self.cancel.cancel();
                return Err(RelayError::Cancelled);
            }
            self.bytes_sent = true;
        }
        Ok(())
    }
}

/// Cancel `cancel` when the body receiver goes away before `finished`.
fn spawn_disconnect_watcher(tx: mpsc::Sender<Bytes>, cancel: CancellationToken, finished: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = tx.closed() => {
                if !finished.is_cancelled() {
                    tracing::debug!("client disconnected");
                    cancel.cancel();
                }
            }
            () = finished.cancelled() => {}
        }
    });
}
