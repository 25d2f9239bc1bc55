//! Model hot-swapping under load.

use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use textgen::backend::{Device, ScriptedLoader, ScriptedModel, ScriptedModelBuilder};
use textgen::lifecycle::ModelLoader;
use textgen::{
    ChatAgent, EngineConfig, ErrorKind, ModelRequest, SlotId, SlotStatus, StreamEvent,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn large() -> ScriptedModelBuilder {
    ScriptedModelBuilder::from_fixture(fixture("large.json")).unwrap()
}

/// Two models that do not fit on the accelerator together.
fn loader() -> Arc<ScriptedLoader> {
    Arc::new(
        ScriptedLoader::new(8)
            .with_model("m1", large())
            .with_model("m2", large())
            .with_model("small", ScriptedModel::builder().reply("small talk"))
            .with_missing("gone"),
    )
}

#[tokio::test]
async fn test_swap_releases_previous_model_before_loading() {
    let loader = loader();
    let agent = ChatAgent::from_config(EngineConfig::default(), loader.clone()).unwrap();

    agent
        .switch_model(SlotId::Primary, ModelRequest::new("m1"))
        .await
        .unwrap();
    let summary = agent
        .switch_model(SlotId::Primary, ModelRequest::new("m2"))
        .await
        .unwrap();

    assert_eq!(summary.name, "m2");
    assert_eq!(loader.live_instances("m1"), 0);
    assert_eq!(loader.live_instances("m2"), 1);
    assert_eq!(loader.memory_in_use(Device::Accelerator(0)), Some(6));
}

#[tokio::test]
async fn test_swap_waits_for_running_generation() {
    let loader = loader();
    let agent = ChatAgent::from_config(EngineConfig::default(), loader.clone()).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("m1"))
        .await
        .unwrap();
    let id = agent.open_conversation(SlotId::Primary).await;

    let mut stream = agent
        .submit(id, "Who are you?", None)
        .await
        .unwrap();
    // The turn holds the model once its first increment arrives.
    assert!(matches!(stream.next().await, Some(StreamEvent::PartialText(_))));

    let swapper = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .switch_model(SlotId::Primary, ModelRequest::new("m2"))
                .await
        })
    };

    let rest: Vec<StreamEvent> = stream.collect().await;
    assert_eq!(
        rest.last(),
        Some(&StreamEvent::Done("I am the large model.".to_string()))
    );

    let summary = swapper.await.unwrap().unwrap();
    assert_eq!(summary.name, "m2");
    assert_eq!(loader.live_instances("m1"), 0);
}

#[tokio::test]
async fn test_failed_load_degrades_conversations() {
    let agent = ChatAgent::from_config(EngineConfig::default(), loader()).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("small"))
        .await
        .unwrap();

    let degraded = agent
        .switch_model(SlotId::Primary, ModelRequest::new("gone"))
        .await
        .unwrap_err();
    assert_eq!(degraded.slot, SlotId::Primary);
    assert!(matches!(
        agent.status(SlotId::Primary).await,
        SlotStatus::NoModel { .. }
    ));

    let id = agent.open_conversation(SlotId::Primary).await;
    let events: Vec<StreamEvent> = agent
        .submit(id, "Anyone there?", None)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events, vec![StreamEvent::Failed(ErrorKind::NoModel)]);
}

#[tokio::test]
async fn test_removal_frees_memory() {
    let loader = loader();
    let agent = ChatAgent::from_config(EngineConfig::default(), loader.clone()).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("m1"))
        .await
        .unwrap();

    let degraded = agent
        .switch_model(SlotId::Primary, ModelRequest::remove())
        .await
        .unwrap_err();
    assert_eq!(degraded.reason, "no model is loaded");
    assert_eq!(agent.status(SlotId::Primary).await, SlotStatus::Empty);
    assert_eq!(loader.memory_in_use(Device::Accelerator(0)), Some(0));
}

#[tokio::test]
async fn test_eight_bit_load_fits_both_slots() {
    let loader = loader();
    let agent = ChatAgent::from_config(EngineConfig::default(), loader.clone()).unwrap();

    agent
        .switch_model(SlotId::Primary, ModelRequest::new("m1").with_8bit(true))
        .await
        .unwrap();
    agent
        .switch_model(SlotId::Secondary, ModelRequest::new("m2").with_8bit(true))
        .await
        .unwrap();
    assert_eq!(loader.memory_in_use(Device::Accelerator(0)), Some(6));

    let full = agent
        .switch_model(SlotId::Secondary, ModelRequest::new("m2"))
        .await;
    assert!(full.is_err());
}

#[tokio::test]
async fn test_cancelled_turns_leave_no_workers_behind() {
    let agent = ChatAgent::from_config(EngineConfig::default(), loader()).unwrap();
    agent
        .switch_model(SlotId::Primary, ModelRequest::new("m1"))
        .await
        .unwrap();
    let baseline = agent.session().adapter().live_workers();

    for _ in 0..3 {
        let id = agent.open_conversation(SlotId::Primary).await;
        let mut stream = agent
            .submit(id, "Who are you?", None)
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        agent.cancel(id).await.unwrap();
        while stream.next().await.is_some() {}
    }

    for _ in 0..100 {
        if agent.session().adapter().live_workers() == baseline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.session().adapter().live_workers(), baseline);
}
