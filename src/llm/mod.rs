//! Reasoning workflow interface.
//!
//! The workflow decides what to say. The turn engine treats it as a black box
//! that consumes a transcript plus the prior conversation and produces
//! response text, possibly after a long time.

use crate::error::{Result, VoiceError};
use crate::pipeline::context::ConversationContext;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Produces a response for one user transcript.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Respond to `transcript`.
    ///
    /// `cancel` fires when the turn is interrupted. With the `log` abandoned
    /// workflow policy it never fires and the call is left to finish.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Workflow`] on failure.
    async fn respond(
        &self,
        transcript: &str,
        context: &ConversationContext,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Workflow that answers with the transcript, optionally prefixed.
#[derive(Debug, Clone, Default)]
pub struct EchoWorkflow {
    prefix: String,
}

impl EchoWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Workflow for EchoWorkflow {
    fn name(&self) -> &str {
        "echo"
    }

    async fn respond(
        &self,
        transcript: &str,
        _context: &ConversationContext,
        cancel: CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(VoiceError::Workflow("cancelled".into()));
        }
        let transcript = transcript.trim();
        if self.prefix.is_empty() {
            Ok(transcript.to_owned())
        } else {
            Ok(format!("{} {transcript}", self.prefix))
        }
    }
}
