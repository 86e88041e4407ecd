//! Message types passed between pipeline stages.

use crate::error::{ErrorKind, Result, VoiceError};
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Identifier of one turn. Monotonically increasing per pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transcription text supplied alongside captured audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionHint {
    /// Recognised text, possibly partial.
    pub text: String,
    /// A final hint closes the utterance it belongs to.
    pub is_final: bool,
}

impl TranscriptionHint {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// A chunk of raw audio pushed by the producer.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    seq: u64,
    data: Bytes,
    hint: Option<TranscriptionHint>,
    captured_at: Instant,
}

impl AudioChunk {
    /// Create a chunk with an explicit sequence number.
    pub fn new(seq: u64, data: impl Into<Bytes>) -> Self {
        Self {
            seq,
            data: data.into(),
            hint: None,
            captured_at: Instant::now(),
        }
    }

    /// Attach a transcription hint.
    pub fn with_hint(mut self, hint: TranscriptionHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn hint(&self) -> Option<&TranscriptionHint> {
        self.hint.as_ref()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn has_final_hint(&self) -> bool {
        self.hint.as_ref().is_some_and(|h| h.is_final)
    }
}

/// One complete unit of user speech: sequence-contiguous chunks.
#[derive(Debug, Clone, Default)]
pub struct Utterance {
    chunks: Vec<AudioChunk>,
}

impl Utterance {
    /// An utterance with no audio (explicit end with nothing pushed).
    pub fn empty() -> Self {
        Self::default()
    }

    /// An utterance made of a single chunk.
    pub fn from_chunk(chunk: AudioChunk) -> Self {
        Self {
            chunks: vec![chunk],
        }
    }

    /// Build an utterance from chunks, checking contiguity.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::SequenceViolation`] at the first gap or reordering.
    pub fn from_chunks(chunks: impl IntoIterator<Item = AudioChunk>) -> Result<Self> {
        let mut utterance = Self::empty();
        for chunk in chunks {
            utterance.push(chunk)?;
        }
        Ok(utterance)
    }

    /// Append a chunk. The chunk must directly follow the last one.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::SequenceViolation`] when `chunk.seq()` is not
    /// the successor of the previous chunk.
    pub fn push(&mut self, chunk: AudioChunk) -> Result<()> {
        if let Some(last) = self.chunks.last() {
            let expected = last.seq.saturating_add(1);
            if chunk.seq != expected {
                return Err(VoiceError::SequenceViolation {
                    expected,
                    got: chunk.seq,
                });
            }
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Replace the hint on the last chunk. No-op on an empty utterance.
    pub(crate) fn set_final_hint(&mut self, hint: TranscriptionHint) {
        if let Some(last) = self.chunks.last_mut() {
            last.hint = Some(hint);
        }
    }

    pub fn chunks(&self) -> &[AudioChunk] {
        &self.chunks
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.chunks.first().map(AudioChunk::seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.chunks.last().map(AudioChunk::seq)
    }

    /// Total payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(AudioChunk::len).sum()
    }

    /// Concatenated audio of every chunk.
    pub fn audio(&self) -> Bytes {
        if let [only] = self.chunks.as_slice() {
            return only.data.clone();
        }
        let mut out = BytesMut::with_capacity(self.byte_len());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out.freeze()
    }

    /// Non-empty transcription hints in chunk order.
    pub fn transcription_hints(&self) -> impl Iterator<Item = &str> {
        self.chunks
            .iter()
            .filter_map(|c| c.hint.as_ref())
            .map(|h| h.text.trim())
            .filter(|t| !t.is_empty())
    }

    /// When the first chunk was captured.
    pub fn started_at(&self) -> Option<Instant> {
        self.chunks.first().map(AudioChunk::captured_at)
    }
}

/// Turn lifecycle markers, in state-machine order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Transcribed { transcript: String },
    Responded { text: String },
    Speaking,
    Ended,
    Interrupted,
}

/// An event delivered to the consumer of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceStreamEvent {
    /// Synthesized audio for a turn. `seq` counts frames within the turn from 1.
    Audio {
        turn_id: TurnId,
        seq: u64,
        #[serde(serialize_with = "serialize_base64")]
        data: Bytes,
    },
    /// A turn changed state.
    Lifecycle {
        turn_id: TurnId,
        #[serde(flatten)]
        kind: LifecycleKind,
    },
    /// Something went wrong, either inside a turn or in the pipeline.
    Error {
        turn_id: Option<TurnId>,
        kind: ErrorKind,
        message: String,
    },
}

impl VoiceStreamEvent {
    pub fn lifecycle(turn_id: TurnId, kind: LifecycleKind) -> Self {
        Self::Lifecycle { turn_id, kind }
    }

    /// Error event describing `err`, attributed to `turn_id` when given.
    pub fn from_error(turn_id: Option<TurnId>, fallback: ErrorKind, err: &VoiceError) -> Self {
        Self::Error {
            turn_id,
            kind: err.kind().unwrap_or(fallback),
            message: err.to_string(),
        }
    }

    /// Turn this event belongs to, if any.
    pub fn turn_id(&self) -> Option<TurnId> {
        match self {
            Self::Audio { turn_id, .. } | Self::Lifecycle { turn_id, .. } => Some(*turn_id),
            Self::Error { turn_id, .. } => *turn_id,
        }
    }

    /// Whether this is the last event its turn will ever produce.
    pub fn is_turn_terminal(&self) -> bool {
        match self {
            Self::Lifecycle { kind, .. } => {
                matches!(kind, LifecycleKind::Ended | LifecycleKind::Interrupted)
            }
            Self::Error { turn_id, kind, .. } => turn_id.is_some() && kind.is_turn_terminal(),
            Self::Audio { .. } => false,
        }
    }

    /// Whether no event may follow this one on the stream.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, Self::Error { kind, .. } if kind.is_stream_fatal())
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }
}

/// An event stamped with its global emission sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencedEvent {
    /// Strictly increasing across the whole run, starting at 1.
    #[serde(rename = "event_seq")]
    pub seq: u64,
    #[serde(flatten)]
    pub event: VoiceStreamEvent,
}

fn serialize_base64<S: serde::Serializer>(
    data: &Bytes,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}
