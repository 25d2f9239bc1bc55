//! End-to-end conversation flows through the public API.

use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use textgen::backend::{ScriptedLoader, ScriptedModelBuilder};
use textgen::storage::FileOutputStore;
use textgen::{
    ChatAgent, ConventionPromptBuilder, EngineConfig, ErrorKind, EventStream, FinishReason,
    GenerationOutcome, GenerationParameters, GenerationRequest, GenerationSession,
    ModelLifecycleManager, ModelRequest, PromptConvention, SessionConfig, SlotId, StreamEvent,
};
use tokio_util::sync::CancellationToken;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn scripted(name: &str) -> ScriptedModelBuilder {
    ScriptedModelBuilder::from_fixture(fixture(name)).unwrap()
}

fn loader() -> ScriptedLoader {
    ScriptedLoader::new(8)
        .with_model("assistant", scripted("assistant.json"))
        .with_model("bot", scripted("bot.json"))
        .with_model("flaky", scripted("flaky_oom.json"))
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config
        .prompt_conventions
        .insert("bot".to_string(), PromptConvention::HumanBot);
    config
}

/// Read events until the terminal one, leaving the stream open.
async fn until_terminal(stream: &mut EventStream) -> StreamEvent {
    while let Some(event) = stream.next().await {
        if !matches!(event, StreamEvent::PartialText(_)) {
            return event;
        }
    }
    panic!("stream ended without a terminal event");
}

#[tokio::test]
async fn test_unmatched_stop_spec_ends_at_token_budget() {
    let manager = ModelLifecycleManager::new(Arc::new(loader()));
    manager
        .load(
            SlotId::Primary,
            ModelRequest::new("assistant").with_convention(PromptConvention::HumanBot),
        )
        .await
        .unwrap();
    let session = GenerationSession::new(SessionConfig::default(), Arc::new(ConventionPromptBuilder));

    let lease = manager.lease(SlotId::Primary).await;
    let request = GenerationRequest::new(
        "Who are you?",
        GenerationParameters::default().with_max_new_tokens(10),
    );
    let outcome = session
        .run(lease.as_deref(), &request, None, &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        GenerationOutcome::Completed {
            text,
            finish_reason,
            ..
        } => {
            assert_eq!(finish_reason, FinishReason::MaxTokens);
            assert!(!text.is_empty());
            assert!("I am an assistant who answers".starts_with(&text));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_multi_turn_conversation() {
    let agent = ChatAgent::from_config(config(), Arc::new(loader())).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("bot"))
        .await
        .unwrap();
    let id = agent.open_conversation(SlotId::Primary).await;

    for question in ["Who are you?", "Are you sure?", "Really?"] {
        let events: Vec<StreamEvent> = agent
            .submit(id, question, None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done("I am a bot.".to_string()))
        );
    }

    let history = agent.history(id).await.unwrap();
    let questions: Vec<&str> = history.turns().iter().map(|t| t.user_text.as_str()).collect();
    assert_eq!(questions, vec!["Who are you?", "Are you sure?", "Really?"]);
    assert!(history
        .turns()
        .iter()
        .all(|t| t.response.as_deref() == Some("I am a bot.")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submitting_right_after_done_keeps_every_turn() {
    let agent = ChatAgent::from_config(config(), Arc::new(loader())).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("bot"))
        .await
        .unwrap();
    let id = agent.open_conversation(SlotId::Primary).await;

    for round in 1..=20 {
        let mut stream = agent
            .submit(id, format!("question {}", round), None)
            .await
            .unwrap();
        assert_eq!(
            until_terminal(&mut stream).await,
            StreamEvent::Done("I am a bot.".to_string())
        );

        let history = agent.history(id).await.unwrap();
        assert_eq!(history.len(), round);
        assert!(history.pending_turn().is_none());
    }

    let history = agent.history(id).await.unwrap();
    assert!(history
        .turns()
        .iter()
        .enumerate()
        .all(|(i, t)| t.user_text == format!("question {}", i + 1)
            && t.response.as_deref() == Some("I am a bot.")));
}

#[tokio::test]
async fn test_out_of_memory_turn_stays_retryable() {
    let agent = ChatAgent::from_config(config(), Arc::new(loader())).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("flaky"))
        .await
        .unwrap();
    let id = agent.open_conversation(SlotId::Primary).await;

    let events: Vec<StreamEvent> = agent
        .submit(id, "Hello?", None)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Failed(ErrorKind::AcceleratorOutOfMemory))
    );

    let history = agent.history(id).await.unwrap();
    assert_eq!(
        history.pending_turn().map(|t| t.user_text.as_str()),
        Some("Hello?")
    );

    agent
        .switch_model(SlotId::Primary, ModelRequest::new("bot"))
        .await
        .unwrap();
    let events: Vec<StreamEvent> = agent
        .retry(id, None)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Done("I am a bot.".to_string()))
    );

    let history = agent.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history.turns()[0].user_text, "Hello?");
    assert_eq!(history.turns()[0].response.as_deref(), Some("I am a bot."));
}

#[tokio::test]
async fn test_resubmitting_replaces_interrupted_turn() {
    let agent = ChatAgent::from_config(config(), Arc::new(loader())).unwrap();
    let id = agent.open_conversation(SlotId::Primary).await;

    // No model yet, so the first turn fails and stays pending.
    let text = agent
        .generate(id, "first try", None)
        .await
        .unwrap();
    assert_eq!(text, ErrorKind::NoModel.diagnostic());

    agent
        .switch_model(SlotId::Primary, ModelRequest::new("bot"))
        .await
        .unwrap();
    let text = agent
        .generate(id, "second try", None)
        .await
        .unwrap();
    assert_eq!(text, "I am a bot.");

    let history = agent.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history.turns()[0].user_text, "second try");
}

#[tokio::test]
async fn test_outputs_are_saved_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.save_dir = Some(dir.path().to_path_buf());
    let agent = ChatAgent::from_config(config, Arc::new(loader())).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("bot"))
        .await
        .unwrap();
    let id = agent.open_conversation(SlotId::Primary).await;

    agent
        .generate(id, "Who are you?", None)
        .await
        .unwrap();

    let records = FileOutputStore::new(dir.path()).records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].base_model, "bot");
    assert_eq!(records[0].output, "I am a bot.");
    assert!(records[0].prompt.contains("<human>: Who are you?"));
}

#[tokio::test]
async fn test_side_by_side_slots() {
    let agent = ChatAgent::from_config(config(), Arc::new(loader())).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("bot"))
        .await
        .unwrap();
    agent
        .switch_model(
            SlotId::Secondary,
            ModelRequest::new("assistant").with_convention(PromptConvention::HumanBot),
        )
        .await
        .unwrap();

    let left = agent.open_conversation(SlotId::Primary).await;
    let right = agent.open_conversation(SlotId::Secondary).await;
    let params = GenerationParameters::default();

    let (a, b) = tokio::join!(
        agent.generate(left, "Who are you?", Some(params.clone())),
        agent.generate(right, "Who are you?", Some(params)),
    );
    assert_eq!(a.unwrap(), "I am a bot.");
    assert_eq!(
        b.unwrap(),
        "I am an assistant who answers questions about many different topics."
    );
}

#[tokio::test]
async fn test_complete_returns_every_sequence() {
    let agent = ChatAgent::from_config(config(), Arc::new(loader())).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("assistant"))
        .await
        .unwrap();

    let outcome = agent
        .complete(
            SlotId::Primary,
            "Describe yourself.",
            None,
            Some(GenerationParameters::default().with_beams(2, 2)),
        )
        .await
        .unwrap();

    match outcome {
        GenerationOutcome::Completed { sequences, .. } => assert_eq!(sequences.len(), 2),
        other => panic!("unexpected outcome {:?}", other),
    }
}
