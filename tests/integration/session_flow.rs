//! End-to-end conversations through a live session.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parley::agent::DEPTH_LIMIT_NOTICE;
use parley::config::{ProfileConfig, SttMode, TtsMode};
use parley::llm::{ChatDelta, Message, ToolCall};
use parley::pipeline::TranscriptSegment;
use parley::stt::ThreadedRecognizer;
use parley::tools::ToolRegistry;
use parley::{AudioChunk, PipelineEvent};
use serde_json::json;

use crate::helpers::{
    EchoTts, RoundsLlm, SlowTextRecognizer, TextRecognizer, assistant_text, audio_count, backends,
    next, profile, say, start, until_end_of_turn,
};

fn quick_tts() -> Arc<EchoTts> {
    Arc::new(EchoTts::new(1, Duration::ZERO))
}

#[tokio::test]
async fn marker_utterance_becomes_one_committed_turn() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(RoundsLlm::new(vec![
        RoundsLlm::text(&["Okay", ", lights on."]),
        RoundsLlm::text(&["Fan on."]),
    ]));
    let (mut session, mut events) = start(
        profile(&dir),
        backends(
            Arc::new(TextRecognizer::default()),
            llm.clone(),
            quick_tts(),
            ToolRegistry::new(),
        ),
    );

    say(&session, "turn on the lights <EOU>").await;
    let first = until_end_of_turn(&mut events).await;
    assert_eq!(
        first[0],
        PipelineEvent::Transcript(TranscriptSegment {
            text: "turn on the lights".into(),
            is_final: true,
            end_of_utterance: true,
        })
    );
    let eou = first
        .iter()
        .filter(|e| **e == PipelineEvent::EndOfUtterance)
        .count();
    assert_eq!(eou, 1);
    assert_eq!(assistant_text(&first), "Okay, lights on.");
    assert!(audio_count(&first) > 0);

    // The utterance buffer starts empty for the next turn.
    say(&session, "and the fan <EOU>").await;
    until_end_of_turn(&mut events).await;

    let history = session.stop().await;
    assert_eq!(
        history,
        vec![
            Message::system("You are a concise voice assistant."),
            Message::user("turn on the lights"),
            Message::assistant("Okay, lights on."),
            Message::user("and the fan"),
            Message::assistant("Fan on."),
        ]
    );
    assert_eq!(llm.calls()[1].len(), 4);
}

#[tokio::test]
async fn buffered_recognition_skips_empty_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut profile = profile(&dir);
    profile.stt.mode = SttMode::Buffered;
    profile.stt.sample_rate_hz = 1000;
    profile.stt.buffer_ms = 10;
    let recognizer = Arc::new(TextRecognizer::default());
    let (mut session, mut events) = start(
        profile,
        backends(
            recognizer.clone(),
            Arc::new(RoundsLlm::new(vec![RoundsLlm::text(&["Hi."])])),
            quick_tts(),
            ToolRegistry::new(),
        ),
    );

    session.send_audio(AudioChunk::new(Vec::new())).await.unwrap();
    say(&session, "hello <EOU>").await;
    session
        .send_audio(AudioChunk::new(vec![0u8; 20]))
        .await
        .unwrap();
    let turn = until_end_of_turn(&mut events).await;
    assert_eq!(assistant_text(&turn), "Hi.");

    let history = session.join().await;
    assert_eq!(recognizer.batch_sizes(), vec![31]);
    assert_eq!(history.last(), Some(&Message::assistant("Hi.")));
}

#[tokio::test]
async fn depth_limit_allows_exactly_one_tool_round() {
    let dir = tempfile::tempdir().unwrap();
    let mut profile = profile(&dir);
    profile.llm.tool_call_limit = 1;

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    let counter = Arc::clone(&invocations);
    tools.register_fn(
        "lights",
        "Switch the lights",
        json!({"type": "object", "properties": {"on": {"type": "boolean"}}}),
        move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok("done".to_owned()) }.boxed()
        },
    );
    let call = |id: &str| ChatDelta::tool_calls(vec![ToolCall::new(id, "lights", json!({"on": true}))]);
    let llm = Arc::new(RoundsLlm::new(vec![vec![call("c1")], vec![call("c2")]]));
    let (mut session, mut events) = start(
        profile,
        backends(
            Arc::new(TextRecognizer::default()),
            llm.clone(),
            quick_tts(),
            tools,
        ),
    );

    say(&session, "lights please <EOU>").await;
    let turn = until_end_of_turn(&mut events).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(assistant_text(&turn), DEPTH_LIMIT_NOTICE);
    assert!(turn.iter().any(|e| matches!(e, PipelineEvent::ToolCall(c) if c.id == "c1")));
    assert_eq!(llm.calls().len(), 2);

    let history = session.stop().await;
    let tool_results = history
        .iter()
        .filter(|m| m.tool_call_id.is_some())
        .count();
    assert_eq!(tool_results, 1);
}

#[tokio::test]
async fn barge_in_cuts_off_assistant_audio() {
    let dir = tempfile::tempdir().unwrap();
    let tts = Arc::new(EchoTts::new(100, Duration::from_millis(10)));
    let (mut session, mut events) = start(
        profile(&dir),
        backends(
            Arc::new(TextRecognizer::default()),
            Arc::new(RoundsLlm::new(vec![RoundsLlm::text(&["Once upon a time."])])),
            tts.clone(),
            ToolRegistry::new(),
        ),
    );

    say(&session, "tell me a story <EOU>").await;
    loop {
        if let PipelineEvent::AudioOut(_) = next(&mut events).await {
            break;
        }
    }

    say(&session, "stop").await;
    loop {
        match next(&mut events).await {
            PipelineEvent::Interruption { epoch } => {
                assert_eq!(epoch, 1);
                break;
            }
            PipelineEvent::EndOfTurn => panic!("interrupted turn must not end normally"),
            _ => {}
        }
    }

    let mut late = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        late.push(event);
    }
    assert_eq!(audio_count(&late), 0);
    assert!(tts.cancel_count() >= 1);
    assert_eq!(tts.live(), 0);
    session.stop().await;
}

#[tokio::test]
async fn burst_mode_flushes_on_sentence_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut profile = profile(&dir);
    profile.tts.mode = TtsMode::Burst;
    let tts = quick_tts();
    let (mut session, mut events) = start(
        profile,
        backends(
            Arc::new(TextRecognizer::default()),
            Arc::new(RoundsLlm::new(vec![RoundsLlm::text(&[
                "Hi", " there.", " How", " are you?",
            ])])),
            tts.clone(),
            ToolRegistry::new(),
        ),
    );

    say(&session, "hello <EOU>").await;
    let turn = until_end_of_turn(&mut events).await;
    assert_eq!(
        tts.once_calls(),
        vec!["Hi there.".to_owned(), "How are you?".to_owned()]
    );
    assert_eq!(audio_count(&turn), 2);
    session.stop().await;
}

#[tokio::test]
async fn burst_mode_flushes_on_length() {
    let dir = tempfile::tempdir().unwrap();
    let mut profile = profile(&dir);
    profile.tts.mode = TtsMode::Burst;
    profile.tts.flush_char_threshold = 10;
    let tts = quick_tts();
    let (mut session, mut events) = start(
        profile,
        backends(
            Arc::new(TextRecognizer::default()),
            Arc::new(RoundsLlm::new(vec![RoundsLlm::text(&["abcd", "efg", "hij"])])),
            tts.clone(),
            ToolRegistry::new(),
        ),
    );

    say(&session, "spell <EOU>").await;
    until_end_of_turn(&mut events).await;
    assert_eq!(tts.once_calls(), vec!["abcdefghij".to_owned()]);
    session.stop().await;
}

#[tokio::test]
async fn one_generation_and_one_synthesis_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut profile = profile(&dir);
    profile.tts.mode = TtsMode::Burst;
    let llm = Arc::new(
        RoundsLlm::new(vec![
            RoundsLlm::text(&["One.", " Two.", " Three."]),
            RoundsLlm::text(&["Four.", " Five."]),
        ])
        .with_delay(Duration::from_millis(5)),
    );
    let tts = Arc::new(EchoTts::new(3, Duration::from_millis(5)));
    let (mut session, mut events) = start(
        profile,
        backends(
            Arc::new(TextRecognizer::default()),
            llm.clone(),
            tts.clone(),
            ToolRegistry::new(),
        ),
    );

    // Two utterances back to back: the second waits for the first turn.
    say(&session, "first <EOU>").await;
    say(&session, "second <EOU>").await;
    until_end_of_turn(&mut events).await;
    until_end_of_turn(&mut events).await;

    assert_eq!(llm.max_live(), 1);
    assert_eq!(tts.max_live(), 1);
    assert_eq!(tts.once_calls().len(), 5);
    let history = session.stop().await;
    assert_eq!(history[1], Message::user("first"));
    assert_eq!(history[3], Message::user("second"));
}

#[tokio::test]
async fn explicit_interrupt_without_speech() {
    let dir = tempfile::tempdir().unwrap();
    let (mut session, mut events) = start(
        profile(&dir),
        backends(
            Arc::new(TextRecognizer::default()),
            Arc::new(RoundsLlm::default()),
            quick_tts(),
            ToolRegistry::new(),
        ),
    );
    session.interrupt().unwrap();
    assert_eq!(next(&mut events).await, PipelineEvent::Interruption { epoch: 1 });
    session.stop().await;
    assert!(session.interrupt().is_err());
}

#[tokio::test]
async fn stop_waits_for_the_recognition_worker() {
    let dir = tempfile::tempdir().unwrap();
    let recognizer = SlowTextRecognizer::new(Duration::from_millis(400));
    let finished = recognizer.finished();
    let (mut session, _events) = start(
        profile(&dir),
        backends(
            Arc::new(ThreadedRecognizer::new(recognizer)),
            Arc::new(RoundsLlm::default()),
            quick_tts(),
            ToolRegistry::new(),
        ),
    );

    say(&session, "hello").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop().await;

    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn every_generation_round_is_routed() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = ToolRegistry::new();
    tools.register_fn(
        "lights",
        "Switch the lights",
        json!({"type": "object", "properties": {}}),
        |_args| async { Ok("done".to_owned()) }.boxed(),
    );
    let llm = Arc::new(RoundsLlm::new(vec![
        vec![ChatDelta::tool_calls(vec![ToolCall::new("c1", "lights", json!({}))])],
        RoundsLlm::text(&["On."]),
        RoundsLlm::text(&["Off."]),
    ]));
    let mut backends = backends(
        Arc::new(TextRecognizer::default()),
        llm.clone(),
        quick_tts(),
        tools,
    );
    let selections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&selections);
    backends.router = Arc::new(move |_: &ProfileConfig| {
        format!("model-{}", counter.fetch_add(1, Ordering::SeqCst))
    });
    let (mut session, mut events) = start(profile(&dir), backends);
    assert_eq!(session.model(), "model-0");

    say(&session, "lights on <EOU>").await;
    until_end_of_turn(&mut events).await;
    say(&session, "lights off <EOU>").await;
    until_end_of_turn(&mut events).await;
    session.stop().await;

    assert_eq!(llm.models(), vec!["model-1", "model-2", "model-3"]);
    assert_eq!(selections.load(Ordering::SeqCst), 4);
}
