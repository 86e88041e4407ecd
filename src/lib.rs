//! Voxturn: real-time conversational turn engine.
//!
//! Turns a stream of microphone audio into conversational turns:
//! Audio in → Boundary detection → STT → Workflow → TTS → Ordered events out
//!
//! # Architecture
//!
//! Independent stages connected by bounded async channels:
//! - **Buffer**: bounded chunk queue with blocking or rejecting backpressure
//! - **Boundary detection**: closes utterances on an explicit end, silence, or
//!   a final transcription hint
//! - **Turns**: a state machine per utterance driving the three collaborators
//!   under per-call timeouts and a cancellation token
//! - **Interruption**: barge-in cancels the active turn within a grace period
//! - **Multiplexer**: one pull-based event stream with a global sequence
//!   number, dropping output of turns that already ended
//!
//! Speech-to-text, the reasoning workflow and text-to-speech are injected as
//! trait objects ([`SpeechToText`], [`Workflow`], [`TextToSpeech`]).

pub mod config;
pub mod error;
pub mod host;
pub mod llm;
pub mod pipeline;
pub mod stt;
pub mod tts;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::PipelineConfig;
pub use error::{ErrorKind, Result, VoiceError};
pub use llm::{EchoWorkflow, Workflow};
pub use pipeline::buffer::{AudioChunkBuffer, StreamedAudioInput};
pub use pipeline::context::{ConversationContext, ConversationEntry};
pub use pipeline::messages::{
    AudioChunk, LifecycleKind, SequencedEvent, TranscriptionHint, TurnId, Utterance,
    VoiceStreamEvent,
};
pub use pipeline::multiplexer::VoiceEventStream;
pub use pipeline::runner::{AudioInput, PipelineRunner, VoiceRunResult};
pub use pipeline::turn::{Collaborators, TurnState};
pub use stt::{HintTranscriber, SpeechToText};
pub use tts::{AudioFrameStream, TextToSpeech, ToneSynthesizer};
