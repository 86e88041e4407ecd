//! Text-to-speech collaborator interface.
//!
//! Synthesis is streaming: an implementation returns a stream of PCM frames
//! that the turn forwards as audio events while checking for cancellation
//! between frames.

use crate::config::AudioFormat;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A boxed stream of synthesized audio frames.
pub type AudioFrameStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Converts response text into audio.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start synthesizing `text`.
    ///
    /// The returned stream must stop yielding frames soon after `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Synthesis`] if synthesis cannot start; failures
    /// mid-stream are yielded as stream items.
    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<AudioFrameStream>;
}

/// Generates a short sine tone per word. No model files needed.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    format: AudioFormat,
    frame_duration: Duration,
    frequency_hz: f32,
    pacing: Option<Duration>,
}

impl ToneSynthesizer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            frame_duration: Duration::from_millis(120),
            frequency_hz: 440.0,
            pacing: None,
        }
    }

    pub fn with_frame_duration(mut self, duration: Duration) -> Self {
        self.frame_duration = duration;
        self
    }

    /// Sleep between frames, approximating real-time playback.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    fn render_frame(&self, index: usize) -> Bytes {
        let channels = usize::from(self.format.channels.max(1));
        let width = usize::from(self.format.bytes_per_sample);
        let samples = (self.format.sample_rate as f32 * self.frame_duration.as_secs_f32()) as usize;
        let mut out = BytesMut::with_capacity(samples * channels * width);
        // Alternate between two pitches so consecutive words are audible.
        let freq = if index % 2 == 0 {
            self.frequency_hz
        } else {
            self.frequency_hz * 1.25
        };
        let rate = self.format.sample_rate.max(1) as f32;
        for n in 0..samples {
            let t = n as f32 / rate;
            let value = (t * freq * std::f32::consts::TAU).sin() * 0.3;
            for _ in 0..channels {
                put_sample(&mut out, self.format.bytes_per_sample, value);
            }
        }
        out.freeze()
    }
}

/// Sample widths the tone generator can encode.
fn supported_width(bytes_per_sample: u16) -> bool {
    matches!(bytes_per_sample, 1 | 2 | 4)
}

/// Encode `value` in `[-1, 1]` as unsigned 8-bit, signed 16-bit LE or
/// 32-bit float LE.
fn put_sample(out: &mut BytesMut, bytes_per_sample: u16, value: f32) {
    match bytes_per_sample {
        1 => out.put_u8((value * f32::from(i8::MAX) + 128.0) as u8),
        4 => out.put_f32_le(value),
        _ => out.put_i16_le((value * f32::from(i16::MAX)) as i16),
    }
}

#[async_trait]
impl TextToSpeech for ToneSynthesizer {
    fn name(&self) -> &str {
        "tone"
    }

    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<AudioFrameStream> {
        if self.format.sample_rate == 0 {
            return Err(VoiceError::Synthesis("sample rate must be non-zero".into()));
        }
        if !supported_width(self.format.bytes_per_sample) {
            return Err(VoiceError::Synthesis(format!(
                "unsupported sample width: {} bytes",
                self.format.bytes_per_sample
            )));
        }
        let frames: Vec<Bytes> = text
            .split_whitespace()
            .enumerate()
            .map(|(i, _)| self.render_frame(i))
            .collect();
        let pacing = self.pacing;

        let stream = futures_util::stream::unfold(
            (frames.into_iter(), cancel),
            move |(mut frames, cancel)| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let frame = frames.next()?;
                if let Some(pacing) = pacing {
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(pacing) => {}
                    }
                }
                Some((Ok::<_, VoiceError>(frame), (frames, cancel)))
            },
        );
        Ok(Box::pin(stream))
    }
}
