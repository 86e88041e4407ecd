//! Turn state machine and the controller that drives one turn through the
//! speech-to-text, workflow and text-to-speech collaborators.

use crate::config::{AbandonedWorkflowPolicy, PipelineConfig};
use crate::error::{ErrorKind, Result, VoiceError};
use crate::llm::Workflow;
use crate::pipeline::context::ConversationContext;
use crate::pipeline::messages::{LifecycleKind, TurnId, Utterance, VoiceStreamEvent};
use crate::pipeline::multiplexer::EventSink;
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use futures_util::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

/// Lifecycle state of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    Idle,
    Listening,
    Transcribing,
    AwaitingResponse,
    Speaking,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// `Listening` through `Speaking`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Listening | Self::Transcribing | Self::AwaitingResponse | Self::Speaking
        )
    }

    /// Error kind reported for a turn that dies in this state.
    pub(crate) fn failure_kind(self) -> ErrorKind {
        Stage::for_state(self).kind()
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TurnState::*;
        match (self, next) {
            (Idle, Listening)
            | (Listening, Transcribing)
            | (Listening, Completed)
            | (Transcribing, AwaitingResponse)
            | (AwaitingResponse, Speaking)
            | (Speaking, Completed) => true,
            (from, Cancelled | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::AwaitingResponse => "awaiting_response",
            Self::Speaking => "speaking",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One utterance → transcript → response → audio cycle.
#[derive(Debug)]
pub struct Turn {
    id: TurnId,
    state: TurnState,
    utterance: Utterance,
    transcript: Option<String>,
    response: Option<String>,
    cancel: CancellationToken,
}

impl Turn {
    pub fn new(id: TurnId, utterance: Utterance, cancel: CancellationToken) -> Self {
        Self {
            id,
            state: TurnState::Idle,
            utterance,
            transcript: None,
            response: None,
            cancel,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn utterance(&self) -> &Utterance {
        &self.utterance
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Pipeline`] if the state machine forbids the transition.
    pub fn advance(&mut self, next: TurnState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VoiceError::Pipeline(format!(
                "turn {}: invalid transition {} -> {}",
                self.id, self.state, next
            )));
        }
        debug!(turn_id = %self.id, from = %self.state, to = %next, "turn state");
        self.state = next;
        Ok(())
    }
}

/// The three external capabilities a turn calls.
#[derive(Clone)]
pub struct Collaborators {
    pub stt: Arc<dyn SpeechToText>,
    pub workflow: Arc<dyn Workflow>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl Collaborators {
    pub fn new(
        stt: impl SpeechToText + 'static,
        workflow: impl Workflow + 'static,
        tts: impl TextToSpeech + 'static,
    ) -> Self {
        Self {
            stt: Arc::new(stt),
            workflow: Arc::new(workflow),
            tts: Arc::new(tts),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("stt", &self.stt.name())
            .field("workflow", &self.workflow.name())
            .field("tts", &self.tts.name())
            .finish()
    }
}

/// Final state of a turn as seen by the coordinating task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub id: TurnId,
    pub state: TurnState,
    pub transcript: Option<String>,
    pub response: Option<String>,
}

impl TurnOutcome {
    /// Outcome for a turn whose task never reported back.
    pub(crate) fn forced(id: TurnId, state: TurnState) -> Self {
        Self {
            id,
            state,
            transcript: None,
            response: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Transcription,
    Workflow,
    Synthesis,
}

impl Stage {
    fn kind(self) -> ErrorKind {
        match self {
            Self::Transcription => ErrorKind::TranscriptionError,
            Self::Workflow => ErrorKind::WorkflowError,
            Self::Synthesis => ErrorKind::SynthesisError,
        }
    }

    fn for_state(state: TurnState) -> Self {
        match state {
            TurnState::AwaitingResponse => Self::Workflow,
            TurnState::Speaking | TurnState::Completed => Self::Synthesis,
            _ => Self::Transcription,
        }
    }

    fn timed_out(self, limit: Duration) -> VoiceError {
        let message = format!("timed out after {}ms", limit.as_millis());
        match self {
            Self::Transcription => VoiceError::Transcription(message),
            Self::Workflow => VoiceError::Workflow(message),
            Self::Synthesis => VoiceError::Synthesis(message),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transcription => "transcription",
            Self::Workflow => "workflow",
            Self::Synthesis => "synthesis",
        })
    }
}

/// Why a turn stopped before `Completed`.
enum Stop {
    Cancelled,
    Failed(Stage, VoiceError),
}

/// Race `fut` against the turn's cancellation and a deadline.
async fn guarded<T>(
    cancel: &CancellationToken,
    stage: Stage,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> std::result::Result<T, Stop> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Stop::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Stop::Failed(stage, err)),
            Err(_) => Err(Stop::Failed(stage, stage.timed_out(limit))),
        },
    }
}

/// Drives a single [`Turn`] to a terminal state, emitting its events.
pub struct TurnController {
    turn: Turn,
    collaborators: Collaborators,
    config: Arc<PipelineConfig>,
    context: ConversationContext,
    sink: EventSink,
    state_tx: watch::Sender<TurnState>,
}

impl TurnController {
    /// Returns the controller and a receiver that tracks the turn's state.
    pub fn new(
        turn: Turn,
        collaborators: Collaborators,
        config: Arc<PipelineConfig>,
        context: ConversationContext,
        sink: EventSink,
    ) -> (Self, watch::Receiver<TurnState>) {
        let (state_tx, state_rx) = watch::channel(turn.state());
        (
            Self {
                turn,
                collaborators,
                config,
                context,
                sink,
                state_tx,
            },
            state_rx,
        )
    }

    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    pub(crate) fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Run the turn to completion, cancellation or failure.
    ///
    /// Always emits exactly one terminal event: `ended`, `interrupted`, or an
    /// error event attributed to this turn.
    pub async fn run(self) -> TurnOutcome {
        let span = if self.config.tracing_enabled {
            info_span!(
                "turn",
                turn_id = %self.turn.id(),
                workflow = %self.config.workflow_name
            )
        } else {
            Span::none()
        };
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> TurnOutcome {
        match self.execute().await {
            Ok(()) => {}
            Err(Stop::Cancelled) => {
                info!(state = %self.turn.state(), "turn interrupted");
                self.finish(TurnState::Cancelled);
                self.emit(LifecycleKind::Interrupted);
            }
            Err(Stop::Failed(stage, err)) => {
                warn!(%stage, error = %err, "turn failed");
                self.finish(TurnState::Failed);
                self.sink.emit(VoiceStreamEvent::Error {
                    turn_id: Some(self.turn.id()),
                    kind: stage.kind(),
                    message: err.to_string(),
                });
            }
        }
        TurnOutcome {
            id: self.turn.id(),
            state: self.turn.state(),
            transcript: self.turn.transcript.take(),
            response: self.turn.response.take(),
        }
    }

    async fn execute(&mut self) -> std::result::Result<(), Stop> {
        self.transition(TurnState::Listening)?;

        if self.turn.utterance().is_empty() {
            debug!("empty utterance, completing without collaborators");
            self.emit(LifecycleKind::Started);
            self.transition(TurnState::Completed)?;
            self.emit(LifecycleKind::Ended);
            return Ok(());
        }

        self.transition(TurnState::Transcribing)?;
        self.emit(LifecycleKind::Started);

        let cancel = self.turn.cancel.clone();
        let transcript = guarded(
            &cancel,
            Stage::Transcription,
            self.config.timeouts.transcription(),
            self.collaborators
                .stt
                .transcribe(&self.turn.utterance, cancel.clone()),
        )
        .await?;
        debug!(chars = transcript.len(), "transcribed");
        self.turn.transcript = Some(transcript.clone());
        self.transition(TurnState::AwaitingResponse)?;
        self.emit(LifecycleKind::Transcribed {
            transcript: transcript.clone(),
        });

        let response = self.respond(transcript).await?;
        self.turn.response = Some(response.clone());
        self.transition(TurnState::Speaking)?;
        self.emit(LifecycleKind::Responded {
            text: response.clone(),
        });

        self.speak(&response).await?;
        self.transition(TurnState::Completed)?;
        self.emit(LifecycleKind::Ended);
        Ok(())
    }

    /// Call the workflow in its own task so an interrupted turn can either
    /// abort it or leave it running, per the abandoned-workflow policy.
    async fn respond(&mut self, transcript: String) -> std::result::Result<String, Stop> {
        let workflow = Arc::clone(&self.collaborators.workflow);
        let context = self.context.clone();
        let call_cancel = CancellationToken::new();
        let token = call_cancel.clone();
        let mut handle = tokio::spawn(
            async move { workflow.respond(&transcript, &context, token).await }.in_current_span(),
        );

        let limit = self.config.timeouts.workflow();
        let turn_cancel = self.turn.cancel.clone();
        let joined = tokio::select! {
            biased;
            () = turn_cancel.cancelled() => None,
            joined = tokio::time::timeout(limit, &mut handle) => Some(joined),
        };

        let Some(joined) = joined else {
            match self.config.interruption.abandoned_workflow {
                AbandonedWorkflowPolicy::Cancel => {
                    call_cancel.cancel();
                    handle.abort();
                    debug!("workflow call cancelled with its turn");
                }
                AbandonedWorkflowPolicy::Log => {
                    let turn_id = self.turn.id();
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(Ok(text)) => {
                                info!(%turn_id, response = %text, "abandoned workflow response");
                            }
                            Ok(Err(err)) => {
                                warn!(%turn_id, error = %err, "abandoned workflow call failed");
                            }
                            Err(err) => {
                                warn!(%turn_id, error = %err, "abandoned workflow task died");
                            }
                        }
                    });
                }
            }
            return Err(Stop::Cancelled);
        };

        match joined {
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(err))) => Err(Stop::Failed(Stage::Workflow, err)),
            Ok(Err(join_err)) => Err(Stop::Failed(
                Stage::Workflow,
                VoiceError::Workflow(format!("workflow task failed: {join_err}")),
            )),
            Err(_) => {
                call_cancel.cancel();
                handle.abort();
                Err(Stop::Failed(Stage::Workflow, Stage::Workflow.timed_out(limit)))
            }
        }
    }

    /// Stream synthesized frames as audio events. `speaking` goes out just
    /// before the first frame; a stream with no frames emits neither.
    async fn speak(&mut self, text: &str) -> std::result::Result<(), Stop> {
        let cancel = self.turn.cancel.clone();
        let limit = self.config.timeouts.synthesis();
        let tts = Arc::clone(&self.collaborators.tts);
        let mut frames = guarded(
            &cancel,
            Stage::Synthesis,
            limit,
            tts.synthesize(text, cancel.clone()),
        )
        .await?;

        let mut seq = 0u64;
        loop {
            let next = guarded(&cancel, Stage::Synthesis, limit, async {
                Ok(frames.next().await)
            })
            .await?;
            let Some(frame) = next else {
                break;
            };
            let data = frame.map_err(|err| Stop::Failed(Stage::Synthesis, err))?;
            if cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            seq += 1;
            if seq == 1 {
                if let Some(started) = self.turn.utterance().started_at() {
                    let capture_to_audio_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    debug!(capture_to_audio_ms, "first audio frame");
                }
                self.emit(LifecycleKind::Speaking);
            }
            self.sink.emit(VoiceStreamEvent::Audio {
                turn_id: self.turn.id(),
                seq,
                data,
            });
        }
        debug!(frames = seq, "synthesis finished");
        Ok(())
    }

    fn transition(&mut self, next: TurnState) -> std::result::Result<(), Stop> {
        self.turn
            .advance(next)
            .map_err(|err| Stop::Failed(Stage::for_state(next), err))?;
        self.state_tx.send_replace(next);
        Ok(())
    }

    fn finish(&mut self, terminal: TurnState) {
        if self.turn.advance(terminal).is_ok() {
            self.state_tx.send_replace(terminal);
        }
    }

    fn emit(&self, kind: LifecycleKind) {
        self.sink
            .emit(VoiceStreamEvent::lifecycle(self.turn.id(), kind));
    }
}
