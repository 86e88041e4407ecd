//! Pipeline configuration loaded from and saved to TOML files.

use tempfile::TempDir;
use voxturn::config::{AbandonedWorkflowPolicy, BackpressureMode};
use voxturn::{Collaborators, EchoWorkflow, HintTranscriber, PipelineConfig, PipelineRunner, ToneSynthesizer};

#[test]
fn partial_file_fills_defaults() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("voxturn.toml");
    std::fs::write(
        &path,
        r#"
[buffer]
capacity_chunks = 8
backpressure = "reject"

[interruption]
abandoned_workflow = "log"
"#,
    )
    .unwrap();

    let config = PipelineConfig::from_file(&path).unwrap();
    assert_eq!(config.buffer.capacity_chunks, 8);
    assert_eq!(config.buffer.backpressure, BackpressureMode::Reject);
    assert_eq!(
        config.interruption.abandoned_workflow,
        AbandonedWorkflowPolicy::Log
    );
    assert_eq!(config.boundary, PipelineConfig::default().boundary);
    config.validate().unwrap();
}

#[test]
fn saved_config_loads_back_identically() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("nested").join("voxturn.toml");
    let config = PipelineConfig::default()
        .with_interruption(false)
        .with_replay_capacity(32);

    config.save_to_file(&path).unwrap();
    let loaded = PipelineConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn runner_rejects_invalid_config() {
    let config = PipelineConfig::default().with_replay_capacity(0);
    let collaborators = Collaborators::new(
        HintTranscriber::new(),
        EchoWorkflow::new(),
        ToneSynthesizer::new(config.audio),
    );
    assert!(PipelineRunner::new(config, collaborators).is_err());
}
