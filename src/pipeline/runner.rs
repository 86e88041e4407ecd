//! Top-level orchestration: wires the buffer, boundary detector, turns and
//! event multiplexer together behind `run` and `run_streamed`.
//!
//! Each run is driven by one coordinating task that owns the active turn.
//! Boundaries arrive over a channel, turn completions are joined directly,
//! and nothing else touches the active-turn slot.

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, Result, VoiceError};
use crate::pipeline::boundary::{BoundaryDetector, BoundaryEvent, BoundaryReason};
use crate::pipeline::buffer::StreamedAudioInput;
use crate::pipeline::context::{ConversationContext, ConversationEntry, ConversationHistory};
use crate::pipeline::interruption::{ActiveTurn, Interruption, InterruptionCoordinator};
use crate::pipeline::messages::{AudioChunk, TranscriptionHint, TurnId, Utterance, VoiceStreamEvent};
use crate::pipeline::multiplexer::{EventMultiplexer, EventSink, VoiceEventStream};
use crate::pipeline::turn::{Collaborators, Turn, TurnController, TurnOutcome, TurnState};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Boundary events buffered between the detector and the coordinating task.
const BOUNDARY_CHANNEL_CAPACITY: usize = 8;

/// Finished-turn states kept in a run's snapshot.
const TURN_STATE_LIMIT: usize = 256;

/// A complete, already-terminated recording.
#[derive(Debug, Clone, Default)]
pub struct AudioInput {
    utterance: Utterance,
}

impl AudioInput {
    /// Wrap a whole recording. Empty data yields an empty utterance.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            utterance: Utterance::from_chunk(AudioChunk::new(0, data)),
        }
    }

    /// Attach a known transcript, used by transcribers that read hints.
    ///
    /// Has no effect on an empty recording.
    pub fn with_transcription(mut self, text: impl Into<String>) -> Self {
        self.utterance
            .set_final_hint(TranscriptionHint::final_text(text));
        self
    }

    /// Build from chunks that must already be sequence-contiguous.
    ///
    /// # Errors
    ///
    /// [`VoiceError::SequenceViolation`] at the first gap.
    pub fn from_chunks(chunks: impl IntoIterator<Item = AudioChunk>) -> Result<Self> {
        Ok(Self {
            utterance: Utterance::from_chunks(chunks)?,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn utterance(&self) -> &Utterance {
        &self.utterance
    }
}

impl From<Utterance> for AudioInput {
    fn from(utterance: Utterance) -> Self {
        Self { utterance }
    }
}

/// Live view of a run, updated by the coordinating task.
#[derive(Debug, Clone, Default)]
struct RunSnapshot {
    last_response: Option<String>,
    context: ConversationContext,
    turns: Vec<(TurnId, TurnState)>,
    finished: bool,
}

/// Handle returned by [`PipelineRunner::run`] and
/// [`PipelineRunner::run_streamed`].
#[derive(Debug)]
pub struct VoiceRunResult {
    stream: Option<VoiceEventStream>,
    snapshot: watch::Receiver<RunSnapshot>,
    cancel: CancellationToken,
}

impl VoiceRunResult {
    /// Take the event stream. It can be taken once.
    ///
    /// # Errors
    ///
    /// [`VoiceError::StreamAlreadyTaken`] on the second call.
    pub fn stream(&mut self) -> Result<VoiceEventStream> {
        self.stream.take().ok_or(VoiceError::StreamAlreadyTaken)
    }

    /// Most recent response text produced by the workflow in this run.
    pub fn text(&self) -> Option<String> {
        self.snapshot.borrow().last_response.clone()
    }

    /// Conversation as of the last finished turn.
    pub fn history(&self) -> ConversationContext {
        self.snapshot.borrow().context.clone()
    }

    /// Terminal states of the most recently finished turns, oldest first.
    pub fn turn_states(&self) -> Vec<(TurnId, TurnState)> {
        self.snapshot.borrow().turns.clone()
    }

    /// Whether the coordinating task has stopped.
    pub fn is_finished(&self) -> bool {
        self.snapshot.borrow().finished
    }

    /// Wait for the coordinating task to stop.
    pub async fn finished(&mut self) {
        // An error means the task is gone, which is also finished.
        let _ = self.snapshot.wait_for(|s| s.finished).await;
    }

    /// Stop the run: the active turn is interrupted and the stream ends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Entry point of the turn engine.
#[derive(Debug)]
pub struct PipelineRunner {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    history: SharedHistory,
    next_turn_id: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Conversation shared by every run of one runner.
type SharedHistory = Arc<Mutex<ConversationHistory>>;

fn lock_history(history: &SharedHistory) -> MutexGuard<'_, ConversationHistory> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineRunner {
    /// Validate `config` and build a runner.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Config`] if the configuration is invalid.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let history = ConversationHistory::new(config.conversation.max_history_turns);
        Ok(Self {
            config: Arc::new(config),
            collaborators,
            history: Arc::new(Mutex::new(history)),
            next_turn_id: Arc::new(AtomicU64::new(1)),
            cancel: CancellationToken::new(),
        })
    }

    /// Seed the conversation. Later runs continue from whatever earlier runs
    /// on this runner recorded.
    pub fn with_context(self, context: ConversationContext) -> Self {
        *lock_history(&self.history) =
            ConversationHistory::from_context(&context, self.config.conversation.max_history_turns);
        self
    }

    /// Conversation recorded so far across all runs.
    pub fn history(&self) -> ConversationContext {
        lock_history(&self.history).snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A fresh live input sized from this runner's configuration.
    pub fn streamed_input(&self) -> StreamedAudioInput {
        StreamedAudioInput::new(&self.config)
    }

    /// Process one complete recording as a single turn.
    ///
    /// Must be called within a Tokio runtime.
    pub fn run(&self, input: AudioInput) -> VoiceRunResult {
        let (tx, rx) = mpsc::channel(1);
        let event = BoundaryEvent::Utterance {
            utterance: input.utterance,
            reason: BoundaryReason::Explicit,
        };
        if let Err(err) = tx.try_send(event) {
            warn!("failed to queue recording: {err}");
        }
        drop(tx);
        self.start(rx, self.cancel.child_token())
    }

    /// Process live audio until `input` is closed or the run is cancelled.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Pipeline`] if `input` is already attached to a run.
    pub fn run_streamed(&self, input: &StreamedAudioInput) -> Result<VoiceRunResult> {
        let detector = BoundaryDetector::new(Arc::clone(input.buffer()), &self.config.boundary)?;
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(BOUNDARY_CHANNEL_CAPACITY);
        tokio::spawn(detector.run(tx, cancel.clone()));
        Ok(self.start(rx, cancel))
    }

    /// Cancel every run started by this runner.
    pub fn shutdown(&self) {
        info!("voice pipeline shutting down");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn start(
        &self,
        boundaries: mpsc::Receiver<BoundaryEvent>,
        cancel: CancellationToken,
    ) -> VoiceRunResult {
        let (sink, stream) =
            EventMultiplexer::new(self.config.events.replay_capacity, cancel.clone()).into_parts();
        let (snapshot_tx, snapshot) = watch::channel(RunSnapshot {
            context: self.history(),
            ..RunSnapshot::default()
        });

        let coordinator = Coordinator {
            config: Arc::clone(&self.config),
            collaborators: self.collaborators.clone(),
            interruptions: InterruptionCoordinator::new(&self.config.interruption, sink.clone()),
            sink,
            history: Arc::clone(&self.history),
            next_turn_id: Arc::clone(&self.next_turn_id),
            cancel: cancel.clone(),
            snapshot: snapshot_tx,
        };
        tokio::spawn(coordinator.drive(boundaries));

        VoiceRunResult {
            stream: Some(stream),
            snapshot,
            cancel,
        }
    }
}

/// What woke the coordinating task.
enum Step {
    Shutdown,
    TurnFinished(TurnOutcome),
    Boundary(Option<BoundaryEvent>),
}

/// Owns the active turn for one run.
struct Coordinator {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    interruptions: InterruptionCoordinator,
    sink: EventSink,
    history: SharedHistory,
    next_turn_id: Arc<AtomicU64>,
    cancel: CancellationToken,
    snapshot: watch::Sender<RunSnapshot>,
}

impl Coordinator {
    async fn drive(mut self, mut boundaries: mpsc::Receiver<BoundaryEvent>) {
        info!(workflow = %self.config.workflow_name, "voice run started");
        let mut active: Option<ActiveTurn> = None;
        let mut input_open = true;

        loop {
            if active.is_none() {
                if let Some(next) = self.interruptions.take_pending() {
                    active = Some(self.start_turn(next));
                    continue;
                }
                if !input_open {
                    break;
                }
            }

            // A full pending queue leaves boundaries unread, which fills the
            // boundary channel and then the ingestion buffer.
            let accepting = input_open && self.interruptions.has_room();
            if input_open && !accepting {
                debug!(
                    pending = self.interruptions.pending_len(),
                    "pending queue full, pausing boundary intake"
                );
            }
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Shutdown,
                outcome = join_active(&mut active) => Step::TurnFinished(outcome),
                event = boundaries.recv(), if accepting => Step::Boundary(event),
            };

            match step {
                Step::Shutdown => {
                    if let Some(turn) = active.take() {
                        let outcome = self.interruptions.preempt(turn).await;
                        self.record(&outcome);
                    }
                    let dropped = self.interruptions.clear_pending();
                    if dropped > 0 {
                        debug!(dropped, "discarding queued utterances on shutdown");
                    }
                    break;
                }
                Step::TurnFinished(outcome) => {
                    active = None;
                    self.record(&outcome);
                }
                Step::Boundary(None) => {
                    debug!("audio input closed");
                    input_open = false;
                }
                Step::Boundary(Some(BoundaryEvent::Rejected(err))) => {
                    self.sink.emit(VoiceStreamEvent::from_error(
                        None,
                        ErrorKind::SequenceViolation,
                        &err,
                    ));
                }
                Step::Boundary(Some(BoundaryEvent::Utterance { utterance, reason })) => {
                    debug!(?reason, chunks = utterance.len(), "utterance ready");
                    active = match active.take() {
                        None => Some(self.start_turn(utterance)),
                        Some(turn) => {
                            match self
                                .interruptions
                                .on_new_utterance_while_active(turn, utterance)
                                .await
                            {
                                Interruption::Queued(turn) => Some(turn),
                                Interruption::Preempted { outcome, next } => {
                                    self.record(&outcome);
                                    Some(self.start_turn(next))
                                }
                            }
                        }
                    };
                }
            }
        }

        self.snapshot.send_modify(|s| s.finished = true);
        info!("voice run finished");
    }

    fn start_turn(&mut self, utterance: Utterance) -> ActiveTurn {
        let id = TurnId(self.next_turn_id.fetch_add(1, Ordering::Relaxed));
        debug!(turn_id = %id, chunks = utterance.len(), "starting turn");
        let turn = Turn::new(id, utterance, self.cancel.child_token());
        let (controller, state) = TurnController::new(
            turn,
            self.collaborators.clone(),
            Arc::clone(&self.config),
            lock_history(&self.history).snapshot(),
            self.sink.clone(),
        );
        ActiveTurn::spawn(controller, state)
    }

    fn record(&mut self, outcome: &TurnOutcome) {
        let interrupted = match outcome.state {
            TurnState::Completed => false,
            TurnState::Cancelled => true,
            _ => {
                self.publish(outcome);
                return;
            }
        };
        if let (Some(user_text), Some(assistant_text)) = (&outcome.transcript, &outcome.response) {
            lock_history(&self.history).record(ConversationEntry {
                user_text: user_text.clone(),
                assistant_text: assistant_text.clone(),
                interrupted,
            });
        }
        self.publish(outcome);
    }

    fn publish(&self, outcome: &TurnOutcome) {
        let context = lock_history(&self.history).snapshot();
        self.snapshot.send_modify(|s| {
            s.context = context;
            if s.turns.len() >= TURN_STATE_LIMIT {
                s.turns.remove(0);
            }
            s.turns.push((outcome.id, outcome.state));
            if let Some(response) = &outcome.response {
                s.last_response = Some(response.clone());
            }
        });
    }
}

async fn join_active(active: &mut Option<ActiveTurn>) -> TurnOutcome {
    match active {
        Some(turn) => turn.join().await,
        None => std::future::pending().await,
    }
}
