#![allow(clippy::unwrap_used)]
// Pub/sub transport against an in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use cloudlink_core::{
    ChannelOperation, ConnectionConfig, ConnectionController, ConnectionState, Endpoint,
    LifecycleEvent, LinkSettings, PubSubEndpoint, TransportKind, Verdict,
};
use common::{FixedMetrics, MemoryBroker, Recorder, heartbeat_request, heartbeat_request_at};

const SHARED: &str = "echocloud:all";
const OWN: &str = "echocloud:srv-1";

fn controller(broker: &MemoryBroker, max_attempts: u32) -> (ConnectionController, Recorder) {
    let endpoint = PubSubEndpoint::new(Arc::new(broker.clone()));
    let settings = LinkSettings::new("srv-1", Endpoint::PubSub(endpoint));
    let config = ConnectionConfig {
        max_reconnect_attempts: max_attempts,
        ..ConnectionConfig::default()
    };
    let controller = ConnectionController::new(settings, config);
    controller.set_metrics_source(Arc::new(FixedMetrics));
    let recorder = Recorder::attach(controller.event_bus());
    (controller, recorder)
}

async fn connected(broker: &MemoryBroker) -> (ConnectionController, Recorder) {
    let (controller, recorder) = controller(broker, 5);
    controller.connect().unwrap();
    recorder.wait_for_count("connection_established", 1).await;
    (controller, recorder)
}

#[tokio::test(start_paused = true)]
async fn subscribes_to_shared_and_own_channel() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;
    recorder
        .wait_for("both subscriptions", |kinds| {
            kinds
                .iter()
                .filter(|k| {
                    matches!(
                        k,
                        LifecycleEvent::ChannelActivity {
                            operation: ChannelOperation::Subscribe,
                            ..
                        }
                    )
                })
                .count()
                == 2
        })
        .await;

    let subscribed: Vec<String> = recorder
        .kinds()
        .into_iter()
        .filter_map(|k| match k {
            LifecycleEvent::ChannelActivity {
                channel,
                operation: ChannelOperation::Subscribe,
                ..
            } => Some(channel),
            _ => None,
        })
        .collect();
    assert_eq!(subscribed, vec![OWN, SHARED]);
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert!(
        recorder
            .events()
            .iter()
            .all(|e| e.transport == TransportKind::PubSub)
    );
}

#[tokio::test(start_paused = true)]
async fn request_for_this_server_gets_one_response() {
    let broker = MemoryBroker::new();
    let (_controller, recorder) = connected(&broker).await;

    broker.deliver(SHARED, &heartbeat_request("srv-1"));
    recorder.wait_for_count("heartbeat_response_sent", 1).await;

    let responses = broker.published_on(SHARED);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["type"], "heartbeat_response");
    assert_eq!(responses[0]["server_id"], "srv-1");
    assert_eq!(responses[0]["request_timestamp"], "2024-01-01T00:00:00Z");
    assert_eq!(responses[0]["players_online"], json!(["Steve", "Alex"]));
}

#[tokio::test(start_paused = true)]
async fn responses_follow_request_order() {
    let broker = MemoryBroker::new();
    let (_controller, recorder) = connected(&broker).await;

    let stamps = [
        "2024-01-01T00:00:01Z",
        "2024-01-01T00:00:02Z",
        "2024-01-01T00:00:03Z",
        "2024-01-01T00:00:04Z",
    ];
    for stamp in stamps {
        broker.deliver(SHARED, &heartbeat_request_at("srv-1", stamp));
    }
    recorder.wait_for_count("heartbeat_response_sent", stamps.len()).await;

    let answered: Vec<String> = broker
        .published_on(SHARED)
        .iter()
        .map(|r| r["request_timestamp"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(answered, stamps);
}

#[tokio::test(start_paused = true)]
async fn request_for_another_server_is_ignored() {
    let broker = MemoryBroker::new();
    let (_controller, recorder) = connected(&broker).await;

    broker.deliver(SHARED, &heartbeat_request("srv-2"));
    recorder
        .wait_for("delivery", |kinds| {
            kinds.iter().any(|k| {
                matches!(
                    k,
                    LifecycleEvent::ChannelActivity {
                        operation: ChannelOperation::MessageReceived,
                        ..
                    }
                )
            })
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(broker.published().is_empty());
    assert_eq!(recorder.count("heartbeat_request_received"), 0);
    assert_eq!(recorder.count("heartbeat_response_sent"), 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_request_is_answered() {
    let broker = MemoryBroker::new();
    let (_controller, recorder) = connected(&broker).await;

    broker.deliver(SHARED, &heartbeat_request("all"));
    recorder.wait_for_count("heartbeat_response_sent", 1).await;

    let responses = broker.published_on(SHARED);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["server_id"], "srv-1");
}

#[tokio::test(start_paused = true)]
async fn own_reports_on_shared_channel_are_ignored() {
    let broker = MemoryBroker::new();
    let (_controller, recorder) = connected(&broker).await;

    broker.deliver(SHARED, &heartbeat_request("srv-1"));
    recorder.wait_for_count("heartbeat_response_sent", 1).await;
    // The broker echoes our own response back to us.
    let (_, echoed) = broker.published().remove(0);
    broker.deliver(SHARED, &echoed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.published().len(), 1);
    assert_eq!(recorder.count("message_received"), 0);
}

#[tokio::test(start_paused = true)]
async fn log_events_publish_on_own_channel() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;

    controller.send_log_event("Steve", "uuid-1", "switch", false);

    let logs = broker.published_on(OWN);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["playerName"], "Steve");
    assert_eq!(logs[0]["action"], "switch");
    assert!(recorder.kinds().iter().any(|k| matches!(
        k,
        LifecycleEvent::LogForwarded { success: true, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn server_messages_are_routed_by_target() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;

    controller.send_server_message("srv-2", "transfer", json!({"player": "Steve"}));
    let sent = broker.published_on("echocloud:srv-2");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["sender_id"], "srv-1");
    assert_eq!(sent[0]["message_type"], "transfer");
    assert!(recorder.kinds().contains(&LifecycleEvent::ServerMessageSent {
        target: "srv-2".into(),
        message_type: "transfer".into(),
        success: true,
    }));

    let inbound = json!({
        "sender_id": "lobby",
        "target_id": "srv-1",
        "message_type": "transfer",
        "payload": {"player": "Alex"},
        "timestamp": "2024-01-01T00:00:00Z",
    })
    .to_string();
    broker.deliver(OWN, &inbound);
    recorder.wait_for_count("message_received", 1).await;

    let received = recorder.kinds().into_iter().find_map(|k| match k {
        LifecycleEvent::MessageReceived { message_type, sender, .. } => Some((message_type, sender)),
        _ => None,
    });
    assert_eq!(received, Some(("transfer".into(), "lobby".into())));
}

#[tokio::test(start_paused = true)]
async fn lost_subscription_reconnects_after_interval() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;

    broker.drop_session();
    recorder.wait_for_count("reconnect_attempted", 1).await;
    assert_eq!(controller.state(), ConnectionState::ReconnectScheduled);
    assert_eq!(broker.opens(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    recorder.wait_for_count("connection_established", 2).await;

    assert_eq!(broker.opens(), 2);
    assert!(recorder.kinds().contains(&LifecycleEvent::ConnectionEstablished {
        endpoint: "memory://broker".into(),
        is_reconnect: true,
    }));
}

#[tokio::test(start_paused = true)]
async fn retuning_applies_to_the_next_drop() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;

    controller.set_reconnect_interval(Duration::from_secs(5));
    controller.set_max_reconnect_attempts(1);
    broker.set_failing(true);
    broker.drop_session();
    recorder.wait_for_count("reconnect_attempted", 1).await;

    assert!(recorder.kinds().contains(&LifecycleEvent::ReconnectAttempted {
        attempt: 1,
        max_attempts: 1,
        delay: Duration::from_secs(5),
    }));

    tokio::time::sleep(Duration::from_secs(6)).await;
    recorder.wait_for_count("reconnect_exhausted", 1).await;
    assert_eq!(broker.opens(), 2);
    assert_eq!(recorder.count("reconnect_attempted"), 1);
}

#[tokio::test(start_paused = true)]
async fn five_failed_connects_then_capacity_exceeded() {
    let broker = MemoryBroker::new();
    broker.set_failing(true);
    let (controller, recorder) = controller(&broker, 5);

    controller.connect().unwrap();
    tokio::time::sleep(Duration::from_secs(30 * 8)).await;
    recorder.wait_for_count("reconnect_exhausted", 1).await;

    assert_eq!(recorder.count("reconnect_attempted"), 5);
    assert_eq!(recorder.count("reconnect_exhausted"), 1);
    // Initial attempt plus five retries.
    assert_eq!(broker.opens(), 6);
    assert_eq!(controller.state(), ConnectionState::Disconnected);

    // An explicit connect starts a fresh streak.
    broker.set_failing(false);
    controller.connect().unwrap();
    recorder.wait_for_count("connection_established", 1).await;
    assert_eq!(broker.opens(), 7);
}

#[tokio::test(start_paused = true)]
async fn vetoed_reconnect_stays_disconnected() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;
    controller
        .event_bus()
        .register_fn(|event: &cloudlink_core::Event| {
            if event.kind.is_cancellable() {
                Verdict::Veto
            } else {
                Verdict::Allow
            }
        });

    broker.drop_session();
    recorder.wait_for_count("reconnect_attempted", 1).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(broker.opens(), 1);
    assert_eq!(recorder.count("reconnect_attempted"), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_publishes_offline_notice_once() {
    let broker = MemoryBroker::new();
    let (controller, recorder) = connected(&broker).await;

    controller.shutdown().await;
    controller.shutdown().await;

    let notices = broker.published_on(SHARED);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0]["type"], "shutdown_notification");
    assert_eq!(notices[0]["server_state"], "OFFLINE");
    assert_eq!(notices[0]["is_running"], false);
    assert_eq!(notices[0]["players_online"], json!([]));
    assert_eq!(notices[0]["max_players"], 50);

    assert!(recorder.kinds().contains(&LifecycleEvent::ShutdownNotified {
        reason: "Server shutdown".into(),
        graceful: true,
    }));
    assert_eq!(recorder.count("shutdown_notified"), 1);
    assert!(controller.connect().is_err());
}
