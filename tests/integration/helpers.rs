//! Shared helpers for integration tests: scripted collaborators and event
//! stream utilities.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voxturn::{
    AudioFrameStream, ConversationContext, ErrorKind, LifecycleKind, Result, SequencedEvent,
    SpeechToText, TextToSpeech, TurnId, Utterance, VoiceError, VoiceEventStream,
    VoiceStreamEvent, Workflow,
};

/// Returns the scripted transcripts in order (repeating the last one) and
/// records the chunk sequence numbers of every utterance it sees.
pub(crate) struct RecordingStt {
    transcripts: Vec<String>,
    calls: AtomicUsize,
    seen: Arc<Mutex<Vec<Vec<u64>>>>,
}

impl RecordingStt {
    pub(crate) fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: transcripts.iter().map(|t| (*t).to_owned()).collect(),
            calls: AtomicUsize::new(0),
            seen: Arc::default(),
        }
    }

    pub(crate) fn seen(&self) -> Arc<Mutex<Vec<Vec<u64>>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl SpeechToText for RecordingStt {
    fn name(&self) -> &str {
        "recording"
    }

    async fn transcribe(&self, utterance: &Utterance, _cancel: CancellationToken) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push(utterance.chunks().iter().map(|c| c.seq()).collect());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.transcripts.len().saturating_sub(1));
        Ok(self.transcripts.get(index).cloned().unwrap_or_default())
    }
}

/// Transcriber whose engine crashes on every call.
pub(crate) struct CrashingStt;

#[async_trait]
impl SpeechToText for CrashingStt {
    fn name(&self) -> &str {
        "crashing"
    }

    async fn transcribe(&self, _utterance: &Utterance, _cancel: CancellationToken) -> Result<String> {
        panic!("speech engine crashed");
    }
}

pub(crate) struct SlowWorkflow {
    reply: String,
    delay: Duration,
    fail: bool,
    context_lengths: Arc<Mutex<Vec<usize>>>,
}

impl SlowWorkflow {
    pub(crate) fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_owned(),
            delay: Duration::ZERO,
            fail: false,
            context_lengths: Arc::default(),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing() -> Self {
        Self {
            reply: String::new(),
            delay: Duration::ZERO,
            fail: true,
            context_lengths: Arc::default(),
        }
    }

    /// History length seen by each call, in call order.
    pub(crate) fn context_lengths(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.context_lengths)
    }
}

#[async_trait]
impl Workflow for SlowWorkflow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn respond(
        &self,
        transcript: &str,
        context: &ConversationContext,
        cancel: CancellationToken,
    ) -> Result<String> {
        self.context_lengths.lock().unwrap().push(context.len());
        tokio::select! {
            () = cancel.cancelled() => return Err(VoiceError::Workflow("cancelled".into())),
            () = tokio::time::sleep(self.delay) => {}
        }
        if self.fail {
            return Err(VoiceError::Workflow(format!("cannot answer {transcript:?}")));
        }
        Ok(self.reply.clone())
    }
}

/// Yields `count` frames, sleeping `delay` before each and honouring
/// cancellation.
pub(crate) struct PacedTts {
    count: usize,
    delay: Duration,
}

impl PacedTts {
    pub(crate) fn new(count: usize, delay: Duration) -> Self {
        Self { count, delay }
    }
}

#[async_trait]
impl TextToSpeech for PacedTts {
    fn name(&self) -> &str {
        "paced"
    }

    async fn synthesize(&self, _text: &str, cancel: CancellationToken) -> Result<AudioFrameStream> {
        let delay = self.delay;
        let stream = futures_util::stream::unfold(
            (0..self.count, cancel),
            move |(mut frames, cancel)| async move {
                let index = frames.next()?;
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
                Some((
                    Ok::<_, VoiceError>(Bytes::from(vec![index as u8; 4])),
                    (frames, cancel),
                ))
            },
        );
        Ok(Box::pin(stream))
    }
}

/// Ignores cancellation and blocks its worker thread before every frame.
pub(crate) struct StubbornTts {
    block: Duration,
}

impl StubbornTts {
    pub(crate) fn new(block: Duration) -> Self {
        Self { block }
    }
}

#[async_trait]
impl TextToSpeech for StubbornTts {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn synthesize(&self, _text: &str, _cancel: CancellationToken) -> Result<AudioFrameStream> {
        let block = self.block;
        let stream = futures_util::stream::iter(0..2u8).map(move |i| {
            std::thread::sleep(block);
            Ok::<_, VoiceError>(Bytes::from(vec![i; 4]))
        });
        Ok(Box::pin(stream))
    }
}

pub(crate) fn pcm(len: usize) -> Vec<u8> {
    vec![0u8; len]
}

/// Pull one event, failing the test after five seconds.
pub(crate) async fn next_event(stream: &mut VoiceEventStream) -> Option<SequencedEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.next_event())
        .await
        .expect("timed out waiting for event")
}

/// Pull events until `stop` matches one (inclusive).
pub(crate) async fn read_until(
    stream: &mut VoiceEventStream,
    stop: impl Fn(&VoiceStreamEvent) -> bool,
) -> Vec<SequencedEvent> {
    let mut events = Vec::new();
    while let Some(event) = next_event(stream).await {
        let done = stop(&event.event);
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// Drain the stream to its end.
pub(crate) async fn collect_events(stream: VoiceEventStream) -> Vec<SequencedEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect_all())
        .await
        .expect("event stream did not end")
}

pub(crate) fn is_lifecycle(event: &VoiceStreamEvent, turn: u64, kind: &LifecycleKind) -> bool {
    matches!(event, VoiceStreamEvent::Lifecycle { turn_id, kind: k } if *turn_id == TurnId(turn) && k == kind)
}

pub(crate) fn is_error(event: &VoiceStreamEvent, expected: ErrorKind) -> bool {
    matches!(event, VoiceStreamEvent::Error { kind, .. } if *kind == expected)
}

/// Compact `turn:name` labels for asserting order.
pub(crate) fn labels(events: &[SequencedEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            let turn = e
                .event
                .turn_id()
                .map_or_else(|| "-".to_owned(), |t| t.to_string());
            let name = match &e.event {
                VoiceStreamEvent::Audio { .. } => "audio",
                VoiceStreamEvent::Error { .. } => "error",
                VoiceStreamEvent::Lifecycle { kind, .. } => match kind {
                    LifecycleKind::Started => "started",
                    LifecycleKind::Transcribed { .. } => "transcribed",
                    LifecycleKind::Responded { .. } => "responded",
                    LifecycleKind::Speaking => "speaking",
                    LifecycleKind::Ended => "ended",
                    LifecycleKind::Interrupted => "interrupted",
                },
            };
            format!("{turn}:{name}")
        })
        .collect()
}

pub(crate) fn position(labels: &[String], label: &str) -> usize {
    labels
        .iter()
        .position(|l| l == label)
        .unwrap_or_else(|| panic!("missing {label} in {labels:?}"))
}
