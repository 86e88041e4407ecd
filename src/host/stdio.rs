//! Stdin/stdout JSON bridge for a streamed voice run.
//!
//! Reads newline-delimited [`HostCommand`] messages, feeds them into a
//! [`StreamedAudioInput`], and writes every [`SequencedEvent`] of the run as
//! a JSON line. Malformed commands and rejected pushes produce a
//! `{"type":"host_error", ...}` line instead of stopping the bridge.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output must go to stderr.

use crate::error::{Result, VoiceError};
use crate::pipeline::buffer::StreamedAudioInput;
use crate::pipeline::messages::{SequencedEvent, TranscriptionHint};
use crate::pipeline::runner::PipelineRunner;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// One line of input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    /// Append audio (base64 PCM) with an optional transcription hint.
    Push {
        #[serde(default, deserialize_with = "deserialize_base64")]
        audio: Bytes,
        #[serde(default)]
        transcription: Option<String>,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    /// The user stopped speaking.
    End,
    /// No more audio; finish pending turns and exit.
    Close,
}

impl HostCommand {
    fn hint(transcription: Option<String>, is_final: bool) -> Option<TranscriptionHint> {
        match transcription {
            Some(text) if is_final => Some(TranscriptionHint::final_text(text)),
            Some(text) => Some(TranscriptionHint::partial(text)),
            None if is_final => Some(TranscriptionHint::final_text("")),
            None => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "host_error")]
struct HostError<'a> {
    message: &'a str,
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// Run one streamed pipeline session until `reader` reaches EOF or a `close`
/// command arrives, then wait for the event stream to drain.
///
/// # Errors
///
/// Returns an error if the run cannot start or writing to `writer` fails.
pub async fn run_stdio_bridge<R, W>(runner: &PipelineRunner, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let input = runner.streamed_input();
    let mut result = runner.run_streamed(&input)?;
    let mut stream = result.stream()?;
    let writer = Arc::new(Mutex::new(writer));

    let event_writer = Arc::clone(&writer);
    let forwarder = tokio::spawn(async move {
        while let Some(event) = stream.next_event().await {
            let json = match serde_json::to_string::<SequencedEvent>(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize event; skipping");
                    continue;
                }
            };
            let mut w = event_writer.lock().await;
            write_line(&mut *w, &json).await?;
        }
        Ok::<(), VoiceError>(())
    });

    let reader_result = run_reader(&input, &mut reader, &writer).await;
    input.close();
    if reader_result.is_err() {
        result.cancel();
    }

    let forwarded = forwarder
        .await
        .map_err(|e| VoiceError::Pipeline(format!("event forwarder failed: {e}")))?;
    reader_result?;
    forwarded
}

async fn run_reader<R, W>(
    input: &StreamedAudioInput,
    reader: &mut R,
    writer: &Arc<Mutex<W>>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            tracing::info!("stdin closed (EOF); closing audio input");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let command: HostCommand = match serde_json::from_str(trimmed) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse host command");
                report(writer, &format!("failed to parse command: {e}")).await?;
                continue;
            }
        };

        let outcome = match command {
            HostCommand::Push {
                audio,
                transcription,
                is_final,
            } => input
                .push_chunk(audio, HostCommand::hint(transcription, is_final))
                .await
                .map(drop),
            HostCommand::End => input.end(),
            HostCommand::Close => {
                tracing::info!("close received; draining pipeline");
                return Ok(());
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "host command rejected");
            report(writer, &e.to_string()).await?;
        }
    }
}

async fn report<W: AsyncWrite + Unpin>(writer: &Arc<Mutex<W>>, message: &str) -> Result<()> {
    let json = serde_json::to_string(&HostError { message })
        .map_err(|e| VoiceError::Pipeline(format!("failed to serialize host error: {e}")))?;
    let mut w = writer.lock().await;
    write_line(&mut *w, &json).await
}

/// Write a single JSON line and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
