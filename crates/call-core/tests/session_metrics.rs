//! Metrics emitted by a live two-party call.
//!
//! Installs a process-wide debugging recorder, so this file holds a single
//! test.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use call_core::signaling::EventType;
use call_test_utils::TestCall;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

fn counter_with_label(snapshotter: &Snapshotter, name: &str, label: (&str, &str)) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| {
            key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label.0 && l.value() == label.1)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => v,
            _ => 0,
        })
        .sum()
}

#[tokio::test]
async fn test_call_records_routing_and_negotiation_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().unwrap();

    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    // Both ends of the pair reached Connected.
    assert!(
        counter_with_label(&snapshotter, "call_negotiations_total", ("outcome", "connected")) >= 2
    );
    // Each client hears its own join echoed back.
    assert!(
        counter_with_label(&snapshotter, "call_signaling_events_total", ("disposition", "self"))
            >= 1
    );

    call.bus.fail_publish_from(&bob.user_id);
    bob.handle.leave().await.unwrap();
    assert_eq!(call.bus.count_of(EventType::Leave), 0);
    assert!(
        counter_with_label(&snapshotter, "call_transport_errors_total", ("operation", "publish"))
            >= 1
    );

    alice.handle.leave().await.unwrap();
    assert!(
        counter_with_label(&snapshotter, "call_negotiations_total", ("outcome", "closed")) >= 1
    );
}
