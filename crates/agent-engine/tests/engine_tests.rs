//! Engine event loop: wire-order application and reconnect resync

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{event, FakeAmi};
use switchboard_agent_engine::{AgentEngine, EngineConfig, SpyMode, SpyTarget};

async fn engine_with(fake: Arc<FakeAmi>) -> AgentEngine {
    AgentEngine::new(fake, EngineConfig::default()).await.unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn seed_resync(fake: &FakeAmi) {
    fake.script_list(
        "CoreShowChannels",
        vec![
            event(
                "CoreShowChannel",
                &[
                    ("Channel", "PJSIP/1016-0000002a"),
                    ("ChannelStateDesc", "Up"),
                    ("BridgeId", "bridge-1"),
                    ("Duration", "00:01:30"),
                ],
            ),
            event(
                "CoreShowChannel",
                &[
                    ("Channel", "PJSIP/trunk-0000002b"),
                    ("ChannelStateDesc", "Up"),
                    ("BridgeId", "bridge-1"),
                ],
            ),
        ],
    );
    fake.script_list(
        "QueueStatus",
        vec![event(
            "QueueMember",
            &[("Queue", "support"), ("Interface", "PJSIP/1016")],
        )],
    );
}

#[tokio::test]
async fn start_rebuilds_the_registry_from_the_pbx() {
    let fake = Arc::new(FakeAmi::new());
    seed_resync(&fake);
    let engine = engine_with(fake.clone()).await;

    let consumer = engine.start().await.unwrap();

    let info = engine.registry().resolve("1016").unwrap();
    assert_eq!(info.name, "PJSIP/1016-0000002a");
    assert_eq!(info.bridge_id.as_deref(), Some("bridge-1"));
    assert_eq!(engine.registry().queues_for("1016"), vec!["support"]);

    consumer.abort();
}

#[tokio::test]
async fn inbound_hangups_update_registry_and_spy_sessions() {
    let fake = Arc::new(FakeAmi::new());
    seed_resync(&fake);
    let engine = engine_with(fake.clone()).await;
    let consumer = engine.start().await.unwrap();

    engine
        .start_spy("2000", SpyTarget::Extension("1016".to_string()), SpyMode::Listen, None)
        .await
        .unwrap();
    assert_eq!(engine.active_spy_sessions().len(), 1);

    fake.emit(event("Hangup", &[("Channel", "PJSIP/1016-0000002a"), ("Cause", "16")]));

    let registry = engine.registry().clone();
    eventually(move || registry.resolve("1016").is_none()).await;
    assert!(engine.active_spy_sessions().is_empty());

    consumer.abort();
}

#[tokio::test]
async fn reconnect_triggers_a_full_rebuild() {
    let fake = Arc::new(FakeAmi::new());
    seed_resync(&fake);
    let engine = engine_with(fake.clone()).await;
    let consumer = engine.start().await.unwrap();
    assert!(engine.registry().resolve("1016").is_some());

    engine
        .start_spy("2000", SpyTarget::Extension("1016".to_string()), SpyMode::Listen, None)
        .await
        .unwrap();

    // The PBX restarts; the old call is gone in the rebuilt view.
    fake.set_connected(false);
    fake.script_list(
        "CoreShowChannels",
        vec![event(
            "CoreShowChannel",
            &[("Channel", "PJSIP/1017-0000002e"), ("ChannelStateDesc", "Up")],
        )],
    );
    fake.set_connected(true);

    let registry = engine.registry().clone();
    eventually(move || {
        registry.resolve("1016").is_none() && registry.resolve("1017").is_some()
    })
    .await;

    // The spy target vanished with the rebuild, so the session was dropped.
    assert!(engine.active_spy_sessions().is_empty());

    consumer.abort();
}

#[tokio::test]
async fn new_channels_arrive_through_the_event_stream() {
    let fake = Arc::new(FakeAmi::new());
    let engine = engine_with(fake.clone()).await;
    let consumer = engine.start().await.unwrap();

    fake.emit(event(
        "Newchannel",
        &[("Channel", "PJSIP/1018-00000030"), ("ChannelStateDesc", "Ring")],
    ));

    let registry = engine.registry().clone();
    eventually(move || registry.resolve("1018").is_some()).await;

    consumer.abort();
}
