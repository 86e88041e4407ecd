//! Interruption of a speaking turn by a new utterance.

use crate::helpers::{
    PacedTts, RecordingStt, SlowWorkflow, StubbornTts, collect_events, is_lifecycle, labels, pcm,
    position, read_until,
};
use std::time::Duration;
use voxturn::{
    AudioChunk, Collaborators, ErrorKind, LifecycleKind, PipelineConfig, PipelineRunner,
    TurnId, TurnState, VoiceStreamEvent,
};

#[tokio::test]
async fn new_utterance_interrupts_speaking_turn() {
    let collaborators = Collaborators::new(
        RecordingStt::new(&["tell me a story", "stop"]),
        SlowWorkflow::replying("once upon a time"),
        PacedTts::new(50, Duration::from_millis(20)),
    );
    let runner = PipelineRunner::new(PipelineConfig::default(), collaborators).unwrap();
    let input = runner.streamed_input();
    let mut result = runner.run_streamed(&input).unwrap();
    let mut stream = result.stream().unwrap();

    for seq in 1..=3 {
        input.buffer().push(AudioChunk::new(seq, pcm(64))).await.unwrap();
    }
    input.end().unwrap();
    let mut events = read_until(&mut stream, |e| e.is_audio()).await;

    input.buffer().push(AudioChunk::new(4, pcm(64))).await.unwrap();
    input.end().unwrap();
    events.extend(read_until(&mut stream, |e| is_lifecycle(e, 2, &LifecycleKind::Ended)).await);
    input.close();
    events.extend(collect_events(stream).await);

    let labels = labels(&events);
    let interrupted = position(&labels, "1:interrupted");
    let started = position(&labels, "2:started");
    assert!(interrupted < started, "{labels:?}");
    assert!(
        !labels[interrupted..].iter().any(|l| l == "1:audio"),
        "turn 1 audio after interruption: {labels:?}"
    );
    assert!(!labels.contains(&"1:ended".to_owned()));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    result.finished().await;
    assert_eq!(
        result.turn_states(),
        vec![(TurnId(1), TurnState::Cancelled), (TurnId(2), TurnState::Completed)]
    );
    let history = result.history();
    assert!(history.entries()[0].interrupted);
}

#[tokio::test]
async fn disabled_interruption_queues_next_turn() {
    let collaborators = Collaborators::new(
        RecordingStt::new(&["one", "two"]),
        SlowWorkflow::replying("answer"),
        PacedTts::new(5, Duration::from_millis(10)),
    );
    let config = PipelineConfig::default().with_interruption(false);
    let runner = PipelineRunner::new(config, collaborators).unwrap();
    let input = runner.streamed_input();
    let mut result = runner.run_streamed(&input).unwrap();
    let mut stream = result.stream().unwrap();

    input.push_chunk(pcm(64), None).await.unwrap();
    input.end().unwrap();
    let mut events = read_until(&mut stream, |e| e.is_audio()).await;
    input.push_chunk(pcm(64), None).await.unwrap();
    input.end().unwrap();
    events.extend(read_until(&mut stream, |e| is_lifecycle(e, 2, &LifecycleKind::Ended)).await);
    input.close();

    let labels = labels(&events);
    assert_eq!(labels.iter().filter(|l| *l == "1:audio").count(), 5);
    assert!(position(&labels, "1:ended") < position(&labels, "2:started"));
    assert!(!labels.contains(&"1:interrupted".to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_turn_is_forced_after_grace_period() {
    let collaborators = Collaborators::new(
        RecordingStt::new(&["first", "second"]),
        SlowWorkflow::replying("reply"),
        StubbornTts::new(Duration::from_millis(300)),
    );
    let config = PipelineConfig::default().with_grace_period(Duration::from_millis(50));
    let runner = PipelineRunner::new(config, collaborators).unwrap();
    let input = runner.streamed_input();
    let mut result = runner.run_streamed(&input).unwrap();
    let mut stream = result.stream().unwrap();

    input.push_chunk(pcm(64), None).await.unwrap();
    input.end().unwrap();
    let mut events =
        read_until(&mut stream, |e| is_lifecycle(e, 1, &LifecycleKind::Speaking)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    input.push_chunk(pcm(64), None).await.unwrap();
    input.end().unwrap();
    events.extend(read_until(&mut stream, |e| is_lifecycle(e, 2, &LifecycleKind::Started)).await);
    input.close();

    let warning = events
        .iter()
        .position(|e| {
            matches!(
                e.event,
                VoiceStreamEvent::Error {
                    turn_id: Some(TurnId(1)),
                    kind: ErrorKind::InterruptionTimeout,
                    ..
                }
            )
        })
        .expect("interruption timeout warning");
    let labels = labels(&events);
    let interrupted = position(&labels, "1:interrupted");
    assert!(warning < interrupted);
    assert!(interrupted < position(&labels, "2:started"));
}
