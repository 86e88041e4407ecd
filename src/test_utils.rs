//! Scripted collaborators and event helpers shared by unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::error::{Result, VoiceError};
use crate::llm::Workflow;
use crate::pipeline::context::ConversationContext;
use crate::pipeline::messages::{LifecycleKind, SequencedEvent, Utterance, VoiceStreamEvent};
use crate::pipeline::multiplexer::VoiceEventStream;
use crate::stt::SpeechToText;
use crate::tts::{AudioFrameStream, TextToSpeech};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `delay` unless `cancel` fires first. Returns `false` if cancelled.
async fn cancellable_sleep(delay: Option<Duration>, cancel: &CancellationToken) -> bool {
    let Some(delay) = delay else {
        return !cancel.is_cancelled();
    };
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

pub struct ScriptedStt {
    result: std::result::Result<String, String>,
}

impl ScriptedStt {
    pub fn returning(text: &str) -> Self {
        Self {
            result: Ok(text.to_owned()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_owned()),
        }
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn transcribe(&self, _utterance: &Utterance, cancel: CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(VoiceError::Transcription("cancelled".into()));
        }
        self.result.clone().map_err(VoiceError::Transcription)
    }
}

/// Panics inside `transcribe`, like a collaborator with a bug.
pub struct PanickingStt;

#[async_trait]
impl SpeechToText for PanickingStt {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn transcribe(&self, _utterance: &Utterance, _cancel: CancellationToken) -> Result<String> {
        panic!("recognizer crashed");
    }
}

pub struct ScriptedWorkflow {
    result: std::result::Result<String, String>,
    delay: Option<Duration>,
    contexts: Arc<Mutex<Vec<ConversationContext>>>,
    completions: Arc<AtomicUsize>,
}

impl ScriptedWorkflow {
    pub fn returning(text: &str) -> Self {
        Self {
            result: Ok(text.to_owned()),
            delay: None,
            contexts: Arc::default(),
            completions: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every context the workflow was called with.
    pub fn contexts(&self) -> Arc<Mutex<Vec<ConversationContext>>> {
        Arc::clone(&self.contexts)
    }

    /// Number of calls that ran to the end.
    pub fn completions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.completions)
    }
}

#[async_trait]
impl Workflow for ScriptedWorkflow {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn respond(
        &self,
        _transcript: &str,
        context: &ConversationContext,
        cancel: CancellationToken,
    ) -> Result<String> {
        self.contexts.lock().unwrap().push(context.clone());
        if !cancellable_sleep(self.delay, &cancel).await {
            return Err(VoiceError::Workflow("cancelled".into()));
        }
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map_err(VoiceError::Workflow)
    }
}

/// Yields `count` four-byte frames, optionally spaced out.
pub struct ScriptedTts {
    count: usize,
    frame_delay: Option<Duration>,
}

impl ScriptedTts {
    pub fn frames(count: usize) -> Self {
        Self {
            count,
            frame_delay: None,
        }
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, _text: &str, cancel: CancellationToken) -> Result<AudioFrameStream> {
        let delay = self.frame_delay;
        let stream = futures_util::stream::unfold(
            (0..self.count, cancel),
            move |(mut frames, cancel)| async move {
                let index = frames.next()?;
                if !cancellable_sleep(delay, &cancel).await {
                    return None;
                }
                let frame = Bytes::from(vec![index as u8; 4]);
                Some((Ok::<_, VoiceError>(frame), (frames, cancel)))
            },
        );
        Ok(Box::pin(stream))
    }
}

/// Blocks the worker thread for `block` before every frame and ignores
/// cancellation, like a misbehaving native engine.
pub struct BlockingTts {
    block: Duration,
}

impl BlockingTts {
    pub fn new(block: Duration) -> Self {
        Self { block }
    }
}

#[async_trait]
impl TextToSpeech for BlockingTts {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn synthesize(&self, _text: &str, _cancel: CancellationToken) -> Result<AudioFrameStream> {
        let block = self.block;
        let stream = futures_util::stream::iter(0..3u8).map(move |i| {
            std::thread::sleep(block);
            Ok::<_, VoiceError>(Bytes::from(vec![i; 4]))
        });
        Ok(Box::pin(stream))
    }
}

/// Drain a stream, failing the test if it does not end within five seconds.
pub async fn collect_events(stream: VoiceEventStream) -> Vec<SequencedEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect_all())
        .await
        .expect("event stream did not end")
}

/// Compact names for asserting event order: lifecycle kinds, `audio`, `error`.
pub fn lifecycle_kinds(events: &[SequencedEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match &e.event {
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
        })
        .collect()
}
