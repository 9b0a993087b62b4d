//! End-to-end call scenarios over the full pipeline with scripted backends.

use std::sync::Arc;
use std::time::Duration;
use switchboard::call::CallSetup;
use switchboard::config::{AgentConfig, ConversationConfig, FunctionConfig, SequencerConfig};
use switchboard::events::{CallEvent, EventKind};
use switchboard::functions::{END_CALL, FunctionRegistry};
use switchboard::pipeline::CallPipeline;
use switchboard::providers::{GeneratorEvent, TranscriberEvent};
use switchboard::test_utils::{
    ChannelTranscriber, ChunkedSynthesizer, RecordingControl, RecordingSink, ScriptedGenerator,
    SessionHandle, SinkOp,
};
use tokio::sync::mpsc;

fn test_config() -> AgentConfig {
    AgentConfig {
        conversation: ConversationConfig {
            greeting: String::new(),
            ..ConversationConfig::default()
        },
        sequencer: SequencerConfig {
            pacing_enabled: false,
            ..SequencerConfig::default()
        },
        functions: FunctionConfig {
            end_call_grace_ms: 0,
            transfer_grace_ms: 0,
            default_transfer_target: String::new(),
        },
        ..AgentConfig::default()
    }
}

fn say(text: &str) -> std::result::Result<GeneratorEvent, switchboard::CallError> {
    Ok(GeneratorEvent::TextDelta {
        text: text.to_owned(),
    })
}

fn done() -> std::result::Result<GeneratorEvent, switchboard::CallError> {
    Ok(GeneratorEvent::Done)
}

struct Call {
    pipeline_task: tokio::task::JoinHandle<switchboard::Result<()>>,
    session: SessionHandle,
    ctx: Arc<switchboard::CallContext>,
    bus: Arc<switchboard::EventBus>,
    _frames_tx: mpsc::Sender<switchboard::AudioFrame>,
}

fn start_call(
    config: AgentConfig,
    generator: ScriptedGenerator,
    synthesizer: ChunkedSynthesizer,
    sink: Arc<RecordingSink>,
    functions: FunctionRegistry,
) -> Call {
    let (transcriber, mut sessions) = ChannelTranscriber::new(1);
    let pipeline = CallPipeline::with_backends(
        config,
        CallSetup {
            call_id: "CA-test".into(),
            caller_number: "+15550100".into(),
            callee_number: "+15550199".into(),
            ..CallSetup::default()
        },
        Arc::new(transcriber),
        Arc::new(generator),
        Arc::new(synthesizer),
        Arc::clone(&sink) as _,
        Arc::new(functions),
    );
    let ctx = pipeline.context();
    let bus = pipeline.bus();
    let (frames_tx, frames_rx) = mpsc::channel(8);
    let pipeline_task = tokio::spawn(pipeline.run(frames_rx));
    Call {
        pipeline_task,
        session: sessions.remove(0),
        ctx,
        bus,
        _frames_tx: frames_tx,
    }
}

fn caller_says(session: &SessionHandle, text: &str) {
    session.send(Ok(TranscriberEvent::SpeechStarted));
    session.send(Ok(TranscriberEvent::Segment {
        text: text.to_owned(),
        endpoint: true,
    }));
}

async fn finish(call: Call) {
    call.session.close();
    drop(call._frames_tx);
    let _ = tokio::time::timeout(Duration::from_secs(5), call.pipeline_task).await;
}

#[tokio::test]
async fn fragments_deliver_in_order_despite_synthesis_races() {
    // Fragment 0 synthesizes slower than fragment 1; delivery order must
    // still follow the ordinals.
    let generator = ScriptedGenerator::with_replies(vec![vec![
        say("Alpha first. Beta second."),
        done(),
    ]]);
    let synthesizer =
        ChunkedSynthesizer::new(1).with_delay("Alpha first.", Duration::from_millis(200));
    let sink = Arc::new(RecordingSink::new());
    let call = start_call(
        test_config(),
        generator,
        synthesizer,
        Arc::clone(&sink),
        FunctionRegistry::new(),
    );

    caller_says(&call.session, "Hello");
    sink.wait_for_audio(2).await;

    assert_eq!(sink.audio_payloads(), ["Alpha first.#0", "Beta second.#0"]);
    finish(call).await;
}

#[tokio::test]
async fn barge_in_stops_delivery_flushes_once_and_recovers() {
    let generator = ScriptedGenerator::with_replies(vec![
        vec![say("One one. Two two. Three three."), done()],
        vec![say("Fresh reply."), done()],
    ]);
    let synthesizer = ChunkedSynthesizer::new(2);
    // Each accepted payload takes a while, so the barge-in lands mid-turn.
    let sink = Arc::new(RecordingSink::with_send_delay(Duration::from_millis(50)));
    let call = start_call(
        test_config(),
        generator,
        synthesizer,
        Arc::clone(&sink),
        FunctionRegistry::new(),
    );

    caller_says(&call.session, "Tell me everything");
    sink.wait_for_audio(2).await;

    // Caller starts talking while chunks are still queued.
    call.session.send(Ok(TranscriberEvent::SpeechStarted));
    sink.wait_for_clear().await;
    call.session.send(Ok(TranscriberEvent::Segment {
        text: "wait, stop".to_owned(),
        endpoint: true,
    }));

    // The fresh turn's audio must arrive after the flush.
    sink.wait_for_audio_matching("Fresh reply.#0").await;

    let ops = sink.ops();
    let clear_count = ops.iter().filter(|op| matches!(op, SinkOp::Clear)).count();
    assert_eq!(clear_count, 1, "exactly one clear per barge-in");

    let clear_at = ops
        .iter()
        .position(|op| matches!(op, SinkOp::Clear))
        .expect("clear present");
    // Before the clear: an in-order prefix of the interrupted reply.
    let expected_order = [
        "One one.#0",
        "One one.#1",
        "Two two.#0",
        "Two two.#1",
        "Three three.#0",
        "Three three.#1",
    ];
    for (i, op) in ops[..clear_at].iter().enumerate() {
        assert_eq!(op, &SinkOp::Audio(expected_order[i].to_owned()));
    }
    // After the clear: nothing from the interrupted turn.
    for op in &ops[clear_at + 1..] {
        if let SinkOp::Audio(payload) = op {
            assert!(
                payload.starts_with("Fresh reply."),
                "stale audio leaked after clear: {payload}"
            );
        }
    }

    assert_eq!(call.ctx.interruption_count(), 1);
    finish(call).await;
}

#[tokio::test]
async fn end_call_function_hangs_up_after_goodbye() {
    let control = Arc::new(RecordingControl::default());
    let mut config = test_config();
    // A real grace window, so the goodbye audio drains before teardown.
    config.functions.end_call_grace_ms = 300;
    let functions = FunctionRegistry::builtin(Arc::clone(&control) as _, &config.functions);
    let generator = ScriptedGenerator::with_replies(vec![vec![
        say("It was a pleasure."),
        Ok(GeneratorEvent::FunctionCall {
            name: END_CALL.into(),
            arguments: serde_json::json!({"reason": "caller finished"}),
        }),
        done(),
    ]]);
    let sink = Arc::new(RecordingSink::new());
    let call = start_call(
        config,
        generator,
        ChunkedSynthesizer::new(1),
        Arc::clone(&sink),
        functions,
    );

    caller_says(&call.session, "bye now");

    tokio::time::timeout(Duration::from_secs(5), call.pipeline_task)
        .await
        .expect("pipeline should end on hangup")
        .expect("join")
        .expect("run");

    assert_eq!(control.ended(), 1);
    assert!(call.ctx.has_ended());
    let payloads = sink.audio_payloads();
    assert!(
        payloads.contains(&"It was a pleasure.#0".to_owned()),
        "reply text was spoken: {payloads:?}"
    );
}

#[tokio::test]
async fn history_has_one_user_turn_per_final_and_one_assistant_per_reply() {
    let generator = ScriptedGenerator::with_replies(vec![
        vec![say("First answer."), done()],
        vec![say("Second answer."), done()],
    ]);
    let sink = Arc::new(RecordingSink::new());
    let call = start_call(
        test_config(),
        generator,
        ChunkedSynthesizer::new(1),
        Arc::clone(&sink),
        FunctionRegistry::new(),
    );

    caller_says(&call.session, "first question");
    sink.wait_for_audio(1).await;
    caller_says(&call.session, "second question");
    sink.wait_for_audio(2).await;

    let history = call.ctx.history_snapshot();
    let rendered: Vec<String> = history
        .iter()
        .map(|t| format!("{:?}:{}", t.role, t.content))
        .collect();
    assert_eq!(
        rendered,
        [
            "User:first question",
            "Assistant:First answer.",
            "User:second question",
            "Assistant:Second answer.",
        ]
    );

    finish(call).await;
}

#[tokio::test]
async fn failed_generation_degrades_the_turn_not_the_call() {
    let generator = ScriptedGenerator::with_replies(vec![
        vec![Err(switchboard::CallError::BackendUnavailable(
            "model offline".into(),
        ))],
        vec![say("Recovered fine."), done()],
    ]);
    let sink = Arc::new(RecordingSink::new());
    let call = start_call(
        test_config(),
        generator,
        ChunkedSynthesizer::new(1),
        Arc::clone(&sink),
        FunctionRegistry::new(),
    );

    caller_says(&call.session, "hello?");
    // The failed turn produces no audio; the next one works.
    caller_says(&call.session, "are you there?");
    sink.wait_for_audio(1).await;

    assert_eq!(sink.audio_payloads(), ["Recovered fine.#0"]);
    let history = call.ctx.history_snapshot();
    assert_eq!(
        history
            .iter()
            .filter(|t| t.role == switchboard::TurnRole::Assistant)
            .count(),
        1,
        "failed reply appended no assistant turn"
    );

    finish(call).await;
}

#[tokio::test]
async fn identical_calls_produce_identical_fragments_and_ordinals() {
    let mut observed = Vec::new();

    for _ in 0..2 {
        let generator = ScriptedGenerator::with_replies(vec![vec![
            say("Same first. Same second."),
            done(),
        ]]);
        let sink = Arc::new(RecordingSink::new());
        let call = start_call(
            test_config(),
            generator,
            ChunkedSynthesizer::new(1),
            Arc::clone(&sink),
            FunctionRegistry::new(),
        );
        let mut events = call
            .bus
            .channel(&[EventKind::ReplyFragment, EventKind::AudioChunk]);

        caller_says(&call.session, "Hello");
        sink.wait_for_audio(2).await;

        let mut trace = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            match event {
                CallEvent::ReplyFragment(f) => {
                    trace.push(format!("frag {} {} {:?}", f.turn, f.ordinal, f.text));
                }
                CallEvent::AudioChunk(c) => {
                    trace.push(format!("chunk {} {} {}", c.turn, c.ordinal, c.seq));
                }
                _ => {}
            }
        }
        trace.sort();
        observed.push(trace);
        finish(call).await;
    }

    assert_eq!(observed[0], observed[1]);
    assert!(!observed[0].is_empty());
}

#[tokio::test]
async fn greeting_plays_before_any_caller_speech() {
    let config = AgentConfig {
        conversation: ConversationConfig {
            greeting: "Front desk, how can I help?".to_owned(),
            ..ConversationConfig::default()
        },
        ..test_config()
    };
    let sink = Arc::new(RecordingSink::new());
    let call = start_call(
        config,
        ScriptedGenerator::with_replies(vec![]),
        ChunkedSynthesizer::new(1),
        Arc::clone(&sink),
        FunctionRegistry::new(),
    );

    sink.wait_for_audio(1).await;
    assert_eq!(sink.audio_payloads(), ["Front desk, how can I help?#0"]);

    finish(call).await;
}
