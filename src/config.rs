//! Configuration types for the turn engine.
//!
//! A [`PipelineConfig`] is resolved once when a pipeline is built and is never
//! mutated afterwards. The `with_*` helpers return modified copies.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a voice pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name reported in every turn span.
    pub workflow_name: String,
    /// Emit a `turn` tracing span per turn.
    pub tracing_enabled: bool,
    /// Format of incoming and synthesized PCM audio.
    pub audio: AudioFormat,
    /// Ingestion buffer limits.
    pub buffer: BufferConfig,
    /// Utterance boundary detection.
    pub boundary: BoundaryConfig,
    /// Barge-in behaviour while a turn is active.
    pub interruption: InterruptionConfig,
    /// Per-call collaborator timeouts.
    pub timeouts: TimeoutConfig,
    /// Output event delivery.
    pub events: EventConfig,
    /// Conversation context passed to the workflow.
    pub conversation: ConversationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow_name: "voice_workflow".to_owned(),
            tracing_enabled: true,
            audio: AudioFormat::default(),
            buffer: BufferConfig::default(),
            boundary: BoundaryConfig::default(),
            interruption: InterruptionConfig::default(),
            timeouts: TimeoutConfig::default(),
            events: EventConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

/// PCM audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bytes per sample (1 = unsigned 8-bit, 2 = 16-bit PCM, 4 = 32-bit float).
    pub bytes_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            bytes_per_sample: 2,
        }
    }
}

impl AudioFormat {
    /// Bytes of audio per second of playback.
    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels) * u64::from(self.bytes_per_sample)
    }

    /// Number of bytes that hold `duration` of audio.
    pub fn bytes_for(&self, duration: Duration) -> u64 {
        let bytes = u128::from(self.bytes_per_second()) * duration.as_millis() / 1000;
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }

    /// Playback duration of `len` bytes.
    pub fn duration_of(&self, len: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((len as u64).saturating_mul(1_000_000) / per_second)
    }
}

/// What `push` does when the ingestion buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Suspend the producer until space is available.
    #[default]
    Block,
    /// Fail immediately with `BufferOverflow`.
    Reject,
}

/// Ingestion buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of queued chunks.
    pub capacity_chunks: usize,
    /// Maximum duration of queued audio in ms.
    pub max_buffer_duration_ms: u64,
    /// Behaviour when either limit is reached.
    pub backpressure: BackpressureMode,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity_chunks: 64,
            max_buffer_duration_ms: 30_000,
            backpressure: BackpressureMode::Block,
        }
    }
}

impl BufferConfig {
    pub fn max_buffer_duration(&self) -> Duration {
        Duration::from_millis(self.max_buffer_duration_ms)
    }
}

/// Utterance boundary detection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Silence (no new chunks) after which an open utterance is closed.
    pub silence_timeout_ms: u64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 800,
        }
    }
}

impl BoundaryConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// What happens to a workflow call whose turn is interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbandonedWorkflowPolicy {
    /// Cancel the workflow call together with the turn.
    #[default]
    Cancel,
    /// Let the call finish in the background and log its response.
    Log,
}

/// Barge-in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    /// Whether a new utterance cancels the active turn. When disabled the new
    /// utterance waits until the active turn finishes.
    pub enabled: bool,
    /// How long a cancelled turn may take to stop before it is force-cancelled.
    pub grace_period_ms: u64,
    /// Fate of a workflow call in flight when its turn is interrupted.
    pub abandoned_workflow: AbandonedWorkflowPolicy,
    /// Utterances allowed to wait behind the active turn. While the queue is
    /// full no further boundaries are accepted, so ingestion backpressure
    /// reaches the producer.
    pub max_pending_utterances: usize,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_ms: 250,
            abandoned_workflow: AbandonedWorkflowPolicy::Cancel,
            max_pending_utterances: 4,
        }
    }
}

impl InterruptionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Collaborator call timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on a speech-to-text call.
    pub transcription_ms: u64,
    /// Bound on a workflow call.
    pub workflow_ms: u64,
    /// Bound on opening a synthesis stream and on the gap between frames.
    pub synthesis_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transcription_ms: 10_000,
            workflow_ms: 30_000,
            synthesis_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn transcription(&self) -> Duration {
        Duration::from_millis(self.transcription_ms)
    }

    pub fn workflow(&self) -> Duration {
        Duration::from_millis(self.workflow_ms)
    }

    pub fn synthesis(&self) -> Duration {
        Duration::from_millis(self.synthesis_ms)
    }
}

/// Output event delivery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Events that may wait for the consumer before the stream overflows.
    pub replay_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 1024,
        }
    }
}

/// Conversation context configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Number of past turns handed to the workflow.
    pub max_history_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 16,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str| Err(VoiceError::Config(format!("{field} must be non-zero")));
        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate");
        }
        if self.audio.channels == 0 {
            return invalid("audio.channels");
        }
        if self.audio.bytes_per_sample == 0 {
            return invalid("audio.bytes_per_sample");
        }
        if self.buffer.capacity_chunks == 0 {
            return invalid("buffer.capacity_chunks");
        }
        if self.buffer.max_buffer_duration_ms == 0 {
            return invalid("buffer.max_buffer_duration_ms");
        }
        if self.boundary.silence_timeout_ms == 0 {
            return invalid("boundary.silence_timeout_ms");
        }
        if self.timeouts.transcription_ms == 0
            || self.timeouts.workflow_ms == 0
            || self.timeouts.synthesis_ms == 0
        {
            return invalid("timeouts");
        }
        if self.interruption.max_pending_utterances == 0 {
            return invalid("interruption.max_pending_utterances");
        }
        if self.events.replay_capacity == 0 {
            return invalid("events.replay_capacity");
        }
        Ok(())
    }

    /// Copy with a different silence timeout.
    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.boundary.silence_timeout_ms = duration_ms(timeout);
        self
    }

    /// Copy with interruption switched on or off.
    pub fn with_interruption(mut self, enabled: bool) -> Self {
        self.interruption.enabled = enabled;
        self
    }

    /// Copy with a different interruption grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.interruption.grace_period_ms = duration_ms(grace);
        self
    }

    /// Copy with different ingestion buffer limits.
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    /// Copy with different collaborator timeouts.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Copy with a different replay buffer capacity.
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.events.replay_capacity = capacity;
        self
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
