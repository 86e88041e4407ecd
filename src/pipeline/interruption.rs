//! Barge-in handling.
//!
//! When a new utterance completes while a turn is still running, the
//! coordinator either queues the utterance (interruption disabled) or cancels
//! the active turn and waits for it to reach `Cancelled` before the caller
//! starts the next turn. A turn that ignores cancellation past the grace
//! period is aborted and its `interrupted` event is emitted on its behalf.

use crate::config::InterruptionConfig;
use crate::error::{ErrorKind, VoiceError};
use crate::pipeline::messages::{LifecycleKind, TurnId, Utterance, VoiceStreamEvent};
use crate::pipeline::multiplexer::EventSink;
use crate::pipeline::turn::{TurnController, TurnOutcome, TurnState};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to the turn currently owning the pipeline.
#[derive(Debug)]
pub struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
    state: watch::Receiver<TurnState>,
    sink: EventSink,
    handle: JoinHandle<TurnOutcome>,
}

impl ActiveTurn {
    /// Spawn `controller` on the runtime.
    pub fn spawn(controller: TurnController, state: watch::Receiver<TurnState>) -> Self {
        let id = controller.turn().id();
        let cancel = controller.turn().cancel_token().clone();
        let sink = controller.sink().clone();
        let handle = tokio::spawn(controller.run());
        Self {
            id,
            cancel,
            state,
            sink,
            handle,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    /// Latest state reported by the turn.
    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the turn to finish on its own.
    pub async fn join(&mut self) -> TurnOutcome {
        let joined = (&mut self.handle).await;
        self.outcome(joined)
    }

    /// Resolve a joined task. A panicked turn never emitted its terminal
    /// event, so an error attributed to the stage it died in is emitted here.
    fn outcome(&self, joined: Result<TurnOutcome, JoinError>) -> TurnOutcome {
        match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => {
                warn!(turn_id = %self.id, "turn task aborted");
                TurnOutcome::forced(self.id, TurnState::Cancelled)
            }
            Err(err) => {
                let last = self.state();
                warn!(turn_id = %self.id, state = %last, error = %err, "turn task panicked");
                self.sink.emit(VoiceStreamEvent::Error {
                    turn_id: Some(self.id),
                    kind: last.failure_kind(),
                    message: format!("turn task panicked while {last}"),
                });
                TurnOutcome::forced(self.id, TurnState::Failed)
            }
        }
    }
}

/// Result of a new utterance arriving while a turn is active.
#[derive(Debug)]
pub enum Interruption {
    /// Interruption is disabled; the utterance waits in the pending queue.
    Queued(ActiveTurn),
    /// The active turn was cancelled; `next` should start now.
    Preempted {
        outcome: TurnOutcome,
        next: Utterance,
    },
}

/// Decides what happens to the active turn when the user speaks again.
#[derive(Debug)]
pub struct InterruptionCoordinator {
    enabled: bool,
    grace: Duration,
    max_pending: usize,
    sink: EventSink,
    pending: VecDeque<Utterance>,
}

impl InterruptionCoordinator {
    pub fn new(config: &InterruptionConfig, sink: EventSink) -> Self {
        Self {
            enabled: config.enabled,
            grace: config.grace_period(),
            max_pending: config.max_pending_utterances.max(1),
            sink,
            pending: VecDeque::new(),
        }
    }

    /// Handle `utterance` completing while `active` is still running.
    ///
    /// Empty utterances never preempt; they queue behind the active turn.
    pub async fn on_new_utterance_while_active(
        &mut self,
        active: ActiveTurn,
        utterance: Utterance,
    ) -> Interruption {
        if !self.enabled || utterance.is_empty() {
            debug!(
                turn_id = %active.id(),
                queued = self.pending.len() + 1,
                "queueing utterance behind active turn"
            );
            self.pending.push_back(utterance);
            return Interruption::Queued(active);
        }
        let outcome = self.preempt(active).await;
        Interruption::Preempted {
            outcome,
            next: utterance,
        }
    }

    /// Cancel `active` and wait for it to stop, forcing it after the grace
    /// period.
    pub async fn preempt(&self, mut active: ActiveTurn) -> TurnOutcome {
        if active.is_finished() {
            return active.join().await;
        }
        info!(turn_id = %active.id(), state = %active.state(), "cancelling active turn");
        active.cancel.cancel();

        match tokio::time::timeout(self.grace, &mut active.handle).await {
            Ok(joined) => active.outcome(joined),
            Err(_) => {
                let err = VoiceError::InterruptionTimeout {
                    turn: active.id().0,
                    grace_ms: u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
                };
                warn!(turn_id = %active.id(), "{err}");
                // The warning goes out first; after `interrupted` it would be
                // dropped as belonging to a finished turn.
                self.sink.emit(VoiceStreamEvent::from_error(
                    Some(active.id()),
                    ErrorKind::InterruptionTimeout,
                    &err,
                ));
                self.sink.emit(VoiceStreamEvent::lifecycle(
                    active.id(),
                    LifecycleKind::Interrupted,
                ));
                active.handle.abort();
                TurnOutcome::forced(active.id(), TurnState::Cancelled)
            }
        }
    }

    /// Next queued utterance, oldest first.
    pub fn take_pending(&mut self) -> Option<Utterance> {
        self.pending.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether another utterance may be queued. The caller stops reading
    /// boundaries while this is false.
    pub fn has_room(&self) -> bool {
        self.pending.len() < self.max_pending
    }

    /// Drop every queued utterance, returning how many there were.
    pub fn clear_pending(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }
}
