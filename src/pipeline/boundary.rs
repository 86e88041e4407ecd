//! Utterance boundary detection.
//!
//! Reads the ingestion buffer and groups chunks into utterances. An
//! utterance closes at the first of: an explicit end marker, the silence
//! timeout elapsing with no new chunk, or a chunk carrying a final
//! transcription hint. Whichever fires first wins; a later end marker for the
//! same utterance is ignored.

use crate::config::BoundaryConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::buffer::{AudioChunkBuffer, BufferItem};
use crate::pipeline::messages::{AudioChunk, Utterance};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What closed an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryReason {
    /// The producer called `end()`.
    Explicit,
    /// No chunk arrived within the silence timeout.
    Silence,
    /// A chunk carried a final transcription hint.
    FinalHint,
    /// The input was closed with audio still pending.
    InputClosed,
}

/// Output of the detector.
#[derive(Debug)]
pub enum BoundaryEvent {
    Utterance {
        utterance: Utterance,
        reason: BoundaryReason,
    },
    /// The current utterance broke sequence ordering and was discarded.
    Rejected(VoiceError),
}

/// Groups buffered chunks into utterances.
#[derive(Debug)]
pub struct BoundaryDetector {
    buffer: Arc<AudioChunkBuffer>,
    silence_timeout: Duration,
    current: Utterance,
    highest_seq: Option<u64>,
    /// Discarding the remainder of an utterance after a sequence violation.
    poisoned: bool,
    /// The last utterance closed on silence or a final hint, so an end marker
    /// that follows belongs to it.
    closed_implicitly: bool,
    finished: bool,
}

impl BoundaryDetector {
    /// Attach to `buffer` as its only reader.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Pipeline`] if the buffer already has a reader.
    pub fn new(buffer: Arc<AudioChunkBuffer>, config: &BoundaryConfig) -> Result<Self> {
        buffer.attach_reader()?;
        Ok(Self {
            buffer,
            silence_timeout: config.silence_timeout(),
            current: Utterance::empty(),
            highest_seq: None,
            poisoned: false,
            closed_implicitly: false,
            finished: false,
        })
    }

    /// Wait for the next boundary. Returns `None` once the buffer is closed
    /// and everything pending has been flushed.
    pub async fn next_event(&mut self) -> Option<BoundaryEvent> {
        loop {
            if self.finished {
                return None;
            }

            let item = if self.current.is_empty() && !self.poisoned {
                self.buffer.next_item().await
            } else {
                match tokio::time::timeout(self.silence_timeout, self.buffer.next_item()).await {
                    Ok(item) => item,
                    Err(_) => {
                        self.closed_implicitly = true;
                        if self.poisoned {
                            self.poisoned = false;
                            continue;
                        }
                        return Some(self.close(BoundaryReason::Silence));
                    }
                }
            };

            match item {
                None => {
                    self.finished = true;
                    if self.current.is_empty() {
                        return None;
                    }
                    return Some(self.close(BoundaryReason::InputClosed));
                }
                Some(BufferItem::EndOfUtterance) => {
                    if let Some(event) = self.on_end() {
                        return Some(event);
                    }
                }
                Some(BufferItem::Chunk(chunk)) => {
                    if let Some(event) = self.on_chunk(chunk) {
                        return Some(event);
                    }
                }
            }
        }
    }

    /// Forward boundaries to `tx` until the input ends or `cancel` fires.
    /// Closes the buffer on the way out so producers stop.
    pub async fn run(mut self, tx: mpsc::Sender<BoundaryEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = self.next_event() => event,
            };
            let Some(event) = event else {
                break;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        self.buffer.close();
        debug!("boundary detector stopped");
    }

    fn on_end(&mut self) -> Option<BoundaryEvent> {
        if self.poisoned {
            self.poisoned = false;
            self.closed_implicitly = false;
            return None;
        }
        if self.current.is_empty() {
            if self.closed_implicitly {
                self.closed_implicitly = false;
                debug!("end marker after implicit boundary ignored");
                return None;
            }
            debug!("explicit end with no audio");
            return Some(BoundaryEvent::Utterance {
                utterance: Utterance::empty(),
                reason: BoundaryReason::Explicit,
            });
        }
        Some(self.close(BoundaryReason::Explicit))
    }

    fn on_chunk(&mut self, chunk: AudioChunk) -> Option<BoundaryEvent> {
        self.closed_implicitly = false;
        let seq = chunk.seq();
        let previous_high = self.highest_seq;
        self.highest_seq = Some(previous_high.map_or(seq, |h| h.max(seq)));
        if self.poisoned {
            return None;
        }

        let expected = match (self.current.last_seq(), previous_high) {
            (Some(last), _) => Some(last.saturating_add(1)).filter(|&e| e != seq),
            (None, Some(highest)) if seq <= highest => Some(highest.saturating_add(1)),
            (None, _) => None,
        };

        if let Some(expected) = expected {
            let err = VoiceError::SequenceViolation { expected, got: seq };
            warn!(
                expected,
                got = seq,
                dropped_chunks = self.current.len(),
                "sequence violation, discarding utterance"
            );
            self.current = Utterance::empty();
            self.poisoned = true;
            return Some(BoundaryEvent::Rejected(err));
        }

        let is_final = chunk.has_final_hint();
        if let Err(err) = self.current.push(chunk) {
            // Unreachable after the contiguity check above.
            self.current = Utterance::empty();
            self.poisoned = true;
            return Some(BoundaryEvent::Rejected(err));
        }
        if is_final {
            self.closed_implicitly = true;
            return Some(self.close(BoundaryReason::FinalHint));
        }
        None
    }

    fn close(&mut self, reason: BoundaryReason) -> BoundaryEvent {
        let utterance = std::mem::take(&mut self.current);
        debug!(?reason, chunks = utterance.len(), "utterance boundary");
        BoundaryEvent::Utterance { utterance, reason }
    }
}
