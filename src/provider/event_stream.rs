//! Drives a backend byte stream through a decoder into canonical events.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::protocol::canonical::CanonicalStreamEvent;

use super::EventStream;

/// Incremental decoder for one backend wire format.
pub trait ByteDecoder: Send + 'static {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<CanonicalStreamEvent>);

    /// End of input. Must close every open block and emit `MessageEnd` + `Done`.
    fn finish(&mut self, out: &mut Vec<CanonicalStreamEvent>);
}

struct DriveState<D> {
    bytes: BoxStream<'static, Result<Bytes, String>>,
    decoder: D,
    pending: VecDeque<CanonicalStreamEvent>,
    scratch: Vec<CanonicalStreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl<D: ByteDecoder> DriveState<D> {
    fn queue_scratch(&mut self) {
        self.pending.extend(self.scratch.drain(..));
    }
}

/// Lazily decode `bytes`. `initial` is yielded before anything is read.
///
/// Cancellation and transport failures end the stream with one error item.
pub fn decode_byte_stream<S, E, D>(
    bytes: S,
    decoder: D,
    initial: Vec<CanonicalStreamEvent>,
    cancel: CancellationToken,
) -> EventStream
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    D: ByteDecoder,
{
    let state = DriveState {
        bytes: bytes.map(|item| item.map_err(|e| e.to_string())).boxed(),
        decoder,
        pending: initial.into(),
        scratch: Vec::with_capacity(8),
        cancel,
        finished: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            let next = tokio::select! {
                biased;
                () = state.cancel.cancelled() => None,
                next = state.bytes.next() => Some(next),
            };
            let Some(next) = next else {
                state.finished = true;
                return Some((Err(RelayError::Cancelled), state));
            };
            match next {
                Some(Ok(chunk)) => {
                    let mut scratch = std::mem::take(&mut state.scratch);
                    state.decoder.push(&chunk, &mut scratch);
                    state.scratch = scratch;
                    state.queue_scratch();
                }
                Some(Err(message)) => {
                    state.finished = true;
                    return Some((
                        Err(RelayError::Transport(format!("backend stream failed: {message}"))),
                        state,
                    ));
                }
                None => {
                    let mut scratch = std::mem::take(&mut state.scratch);
                    state.decoder.finish(&mut scratch);
                    state.scratch = scratch;
                    state.queue_scratch();
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{CanonicalStopReason, CanonicalUsage};

    /// Emits one text delta per chunk.
    struct Echo;

    impl ByteDecoder for Echo {
        fn push(&mut self, chunk: &[u8], out: &mut Vec<CanonicalStreamEvent>) {
            out.push(CanonicalStreamEvent::TextDelta {
                index: 0,
                text: String::from_utf8_lossy(chunk).into_owned(),
            });
        }

        fn finish(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
            out.push(CanonicalStreamEvent::MessageEnd {
                stop_reason: CanonicalStopReason::EndOfTurn,
                usage: CanonicalUsage::default(),
            });
            out.push(CanonicalStreamEvent::Done);
        }
    }

    #[tokio::test]
    async fn yields_initial_then_decoded_then_finish() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, String>(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]);
        let events: Vec<_> = decode_byte_stream(
            chunks,
            Echo,
            vec![CanonicalStreamEvent::Usage(CanonicalUsage::default())],
            CancellationToken::new(),
        )
        .collect()
        .await;
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], Ok(CanonicalStreamEvent::Usage(_))));
        assert!(matches!(events[4], Ok(CanonicalStreamEvent::Done)));
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err("reset".to_owned()),
            Ok(Bytes::from_static(b"never")),
        ]);
        let events: Vec<_> = decode_byte_stream(chunks, Echo, Vec::new(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn cancellation_ends_stream() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks = futures_util::stream::pending::<Result<Bytes, String>>();
        let events: Vec<_> = decode_byte_stream(chunks, Echo, Vec::new(), cancel).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(RelayError::Cancelled)));
    }
}
