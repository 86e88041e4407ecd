//! Speech-to-text collaborator interface.
//!
//! The turn engine never decodes audio itself. It hands each finished
//! [`Utterance`] to a [`SpeechToText`] implementation and waits for the
//! transcript, racing the call against the turn's cancellation token and the
//! configured transcription timeout.

use crate::error::{Result, VoiceError};
use crate::pipeline::messages::Utterance;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Converts one utterance to text.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Transcribe `utterance`.
    ///
    /// Implementations should return promptly once `cancel` fires; the caller
    /// stops waiting either way.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Transcription`] when recognition fails.
    async fn transcribe(&self, utterance: &Utterance, cancel: CancellationToken) -> Result<String>;
}

/// Transcriber that trusts the transcription hints supplied with the audio.
///
/// Useful when capture happens on a device that already runs recognition, and
/// for driving the pipeline from text in tests and the host bridge.
#[derive(Debug, Clone, Default)]
pub struct HintTranscriber {
    require_hint: bool,
}

impl HintTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail instead of returning an empty transcript when no hint is present.
    pub fn require_hint(mut self) -> Self {
        self.require_hint = true;
        self
    }
}

#[async_trait]
impl SpeechToText for HintTranscriber {
    fn name(&self) -> &str {
        "hints"
    }

    async fn transcribe(&self, utterance: &Utterance, cancel: CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(VoiceError::Transcription("cancelled".into()));
        }
        let transcript = utterance.transcription_hints().collect::<Vec<_>>().join(" ");
        if transcript.is_empty() && self.require_hint {
            return Err(VoiceError::Transcription(format!(
                "no transcription hint in {} chunk(s)",
                utterance.len()
            )));
        }
        debug!(chars = transcript.len(), "transcribed from hints");
        Ok(transcript)
    }
}
