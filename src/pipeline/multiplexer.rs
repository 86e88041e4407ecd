//! Single ordered event stream fed by every turn of a run.
//!
//! Producers (turn tasks and the coordinating task) hold cheap [`EventSink`]
//! clones and never wait: events go into one bounded channel that doubles as
//! the replay buffer for a slow consumer. The consumer pulls from
//! [`VoiceEventStream`], which stamps the global sequence number at pull time
//! and drops events of turns that are already finished or superseded.

use crate::error::{ErrorKind, VoiceError};
use crate::pipeline::messages::{SequencedEvent, TurnId, VoiceStreamEvent};
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug)]
struct Shared {
    capacity: usize,
    overflowed: AtomicBool,
    run_cancel: CancellationToken,
}

/// Merges events from all producers of one run.
#[derive(Debug)]
pub struct EventMultiplexer {
    sink: EventSink,
    stream: VoiceEventStream,
}

impl EventMultiplexer {
    /// Create a multiplexer whose replay buffer holds `capacity` events.
    ///
    /// `run_cancel` is cancelled when the buffer overflows or the consumer
    /// drops the stream.
    pub fn new(capacity: usize, run_cancel: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            capacity,
            overflowed: AtomicBool::new(false),
            run_cancel,
        });
        Self {
            sink: EventSink {
                tx,
                shared: Arc::clone(&shared),
            },
            stream: VoiceEventStream {
                rx,
                shared,
                next_seq: 1,
                latest_turn: None,
                latest_terminal: false,
                finished: false,
            },
        }
    }

    pub fn into_parts(self) -> (EventSink, VoiceEventStream) {
        (self.sink, self.stream)
    }
}

/// Producer side of the multiplexer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<VoiceStreamEvent>,
    shared: Arc<Shared>,
}

impl EventSink {
    /// Queue an event without waiting.
    ///
    /// A full replay buffer poisons the sink: the run is cancelled and this
    /// and every later event is discarded.
    pub fn emit(&self, event: VoiceStreamEvent) {
        if self.shared.overflowed.load(Ordering::Acquire) {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.shared.overflowed.swap(true, Ordering::AcqRel) {
                    error!(
                        capacity = self.shared.capacity,
                        "event consumer fell behind, closing stream"
                    );
                    self.shared.run_cancel.cancel();
                }
            }
            Err(TrySendError::Closed(_)) => {
                if !self.shared.run_cancel.is_cancelled() {
                    debug!("event stream dropped by consumer, stopping run");
                    self.shared.run_cancel.cancel();
                }
            }
        }
    }

    pub fn is_overflowed(&self) -> bool {
        self.shared.overflowed.load(Ordering::Acquire)
    }
}

/// Consumer side: a pull-based, strictly ordered event sequence.
///
/// Ends when every producer is gone, or right after the
/// `multiplexer_overflow` error event.
#[derive(Debug)]
pub struct VoiceEventStream {
    rx: mpsc::Receiver<VoiceStreamEvent>,
    shared: Arc<Shared>,
    next_seq: u64,
    latest_turn: Option<TurnId>,
    latest_terminal: bool,
    finished: bool,
}

impl VoiceEventStream {
    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<SequencedEvent> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Drain the stream to completion.
    pub async fn collect_all(mut self) -> Vec<SequencedEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<SequencedEvent>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }

            let next = if self.shared.overflowed.load(Ordering::Acquire) {
                self.rx.try_recv().ok()
            } else {
                ready!(self.rx.poll_recv(cx))
            };

            let Some(event) = next else {
                self.finished = true;
                if self.shared.overflowed.load(Ordering::Acquire) {
                    let err = VoiceError::MultiplexerOverflow {
                        capacity: self.shared.capacity,
                    };
                    let event =
                        VoiceStreamEvent::from_error(None, ErrorKind::MultiplexerOverflow, &err);
                    return Poll::Ready(Some(self.stamp(event)));
                }
                return Poll::Ready(None);
            };

            if self.admit(&event) {
                if event.is_stream_fatal() {
                    self.finished = true;
                }
                return Poll::Ready(Some(self.stamp(event)));
            }
            debug!(turn_id = ?event.turn_id(), "dropping event from finished turn");
        }
    }

    /// Track the newest turn seen and reject anything older or past its
    /// terminal event. Pipeline-level events carry no turn and always pass.
    fn admit(&mut self, event: &VoiceStreamEvent) -> bool {
        let Some(id) = event.turn_id() else {
            return true;
        };
        match self.latest_turn {
            Some(latest) if id < latest => false,
            Some(latest) if id == latest => {
                if self.latest_terminal {
                    return false;
                }
                self.latest_terminal = event.is_turn_terminal();
                true
            }
            _ => {
                self.latest_turn = Some(id);
                self.latest_terminal = event.is_turn_terminal();
                true
            }
        }
    }

    fn stamp(&mut self, event: VoiceStreamEvent) -> SequencedEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        SequencedEvent { seq, event }
    }
}

impl Stream for VoiceEventStream {
    type Item = SequencedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}
