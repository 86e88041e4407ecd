//! Headless voice bridge binary for stdin/stdout JSON communication.
//!
//! Reads `push` / `end` / `close` commands as newline-delimited JSON from
//! stdin and writes every pipeline event as a JSON line to stdout. Runs with
//! built-in collaborators: transcription hints as transcripts, an echo
//! workflow, and a tone synthesizer.
//!
//! Usage: `voxturn-host [config.toml]`
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::path::PathBuf;
use voxturn::host::run_stdio_bridge;
use voxturn::{Collaborators, EchoWorkflow, HintTranscriber, PipelineConfig, PipelineRunner, ToneSynthesizer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing to stderr only (stdout is reserved for the JSON
    // protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxturn=info")),
        )
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PipelineConfig::from_file(&path)?
        }
        None => PipelineConfig::default(),
    };

    let collaborators = Collaborators::new(
        HintTranscriber::new(),
        EchoWorkflow::with_prefix("You said:"),
        ToneSynthesizer::new(config.audio),
    );
    let runner = PipelineRunner::new(config, collaborators)?;

    tracing::info!("voxturn-host starting");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let shutdown = runner.cancel_token();
    tokio::select! {
        result = run_stdio_bridge(&runner, stdin, tokio::io::stdout()) => {
            result.map_err(|e| {
                tracing::error!(error = %e, "voxturn-host exited with error");
                anyhow::anyhow!("voxturn-host failed: {e}")
            })?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            shutdown.cancel();
        }
    }

    tracing::info!("voxturn-host shut down cleanly");
    Ok(())
}
