//! Line-delimited JSON bridge driven over in-memory pipes.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use voxturn::host::run_stdio_bridge;
use voxturn::{
    Collaborators, EchoWorkflow, HintTranscriber, PipelineConfig, PipelineRunner, ToneSynthesizer,
};

fn runner() -> PipelineRunner {
    let config = PipelineConfig::default();
    let collaborators = Collaborators::new(
        HintTranscriber::new(),
        EchoWorkflow::with_prefix("You said:"),
        ToneSynthesizer::new(config.audio).with_frame_duration(Duration::from_millis(5)),
    );
    PipelineRunner::new(config, collaborators).unwrap()
}

#[tokio::test]
async fn push_and_close_produce_json_event_lines() {
    let commands = concat!(
        r#"{"command":"push","audio":"AAAAAA==","transcription":"good morning","final":true}"#,
        "\n",
        r#"{"command":"close"}"#,
        "\n",
    );
    let (writer, reader) = tokio::io::duplex(1 << 20);
    let runner = runner();

    tokio::time::timeout(
        Duration::from_secs(5),
        run_stdio_bridge(&runner, commands.as_bytes(), writer),
    )
    .await
    .expect("bridge finishes after close")
    .unwrap();

    let mut lines = BufReader::new(reader).lines();
    let mut events = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        events.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
    }

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e["kind"].as_str().or_else(|| e["type"].as_str()).unwrap())
        .collect();
    assert_eq!(
        kinds,
        [
            "started",
            "transcribed",
            "responded",
            "speaking",
            "audio",
            "audio",
            "audio",
            "audio",
            "ended",
        ]
    );
    assert_eq!(events[1]["transcript"], "good morning");
    assert_eq!(events[2]["text"], "You said: good morning");
    let seqs: Vec<u64> = events.iter().map(|e| e["event_seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn malformed_line_reports_and_continues() {
    let commands = concat!("not json\n", r#"{"command":"close"}"#, "\n");
    let (writer, reader) = tokio::io::duplex(1 << 16);
    let runner = runner();

    tokio::time::timeout(
        Duration::from_secs(5),
        run_stdio_bridge(&runner, commands.as_bytes(), writer),
    )
    .await
    .expect("bridge finishes after close")
    .unwrap();

    let mut lines = BufReader::new(reader).lines();
    let first = lines.next_line().await.unwrap().expect("host error line");
    let value: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(value["type"], "host_error");
    assert!(lines.next_line().await.unwrap().is_none());
}
