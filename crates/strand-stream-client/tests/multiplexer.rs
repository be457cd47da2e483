// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Multiplexer behaviour against a scripted remote.

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_dry_tests::{backlog, wait_for, wait_for_state, FrameBuilder, ScriptedConnector};
use strand_stream_client::{
    ConnectionState, MultiplexerConfig, ReconnectConfig, RestartMode, StreamError,
    StreamKind, StreamMultiplexer, StreamParams, SubscriptionState, SubscriptionStatus,
};
use strand_stream_proto::{ClientIntent, InboundFrame};
use strand_view::{Cell, MalformedRowError, ViewState};
use tokio_util::sync::CancellationToken;

fn config() -> MultiplexerConfig {
    MultiplexerConfig {
        reconnect: ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::default()
        },
        ..MultiplexerConfig::default()
    }
}

fn query(q: &str) -> StreamParams {
    StreamParams::new(StreamKind::Query).arg("query", q)
}

fn resource() -> StreamParams {
    StreamParams::new(StreamKind::Resource).arg("path", "/interfaces")
}

/// Poll `status` until `pred` holds.
async fn status_until(
    mux: &StreamMultiplexer,
    name: &str,
    pred: impl Fn(&SubscriptionStatus) -> bool,
) -> SubscriptionStatus {
    for _ in 0..200 {
        if let Some(status) = mux.status(name).await {
            if pred(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("status of {name} never matched; last: {:?}", mux.status(name).await);
}

/// Poll the live worker count until it reaches `want`.
async fn workers_until(mux: &StreamMultiplexer, want: usize) {
    for _ in 0..200 {
        if mux.dispatch_workers().await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("dispatch workers stuck at {}, wanted {want}", mux.dispatch_workers().await);
}

fn subscribed_names(intents: &[ClientIntent]) -> Vec<String> {
    let mut names: Vec<String> = intents
        .iter()
        .filter(|i| matches!(i, ClientIntent::Subscribe { .. }))
        .map(|i| i.stream().to_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test(start_paused = true)]
async fn resubscribing_with_new_params_keeps_one_entry_and_one_view() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());

    let first = mux.subscribe("q", query("up")).await.unwrap();
    assert!(first.created);
    let mut end = ends.next().await.unwrap();
    assert_eq!(
        end.next_intent().await.unwrap(),
        ClientIntent::Subscribe {
            stream: "q".into(),
            params: query("up"),
        }
    );

    let mut rx = mux.watch("q").await.unwrap();
    end.send(FrameBuilder::new("q").upsert("1", json!({"name": "a"})).build())
        .await;
    wait_for(&mut rx, |s| s.len() == 1).await.unwrap();

    let second = mux.subscribe("q", query("down")).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.generation, first.generation);
    assert_eq!(mux.subscriptions().await, vec!["q".to_owned()]);
    assert_eq!(mux.status("q").await.unwrap().params, query("down"));

    // Query streams swap parameters in place; the existing view restarts empty.
    assert_eq!(
        end.next_intent().await.unwrap(),
        ClientIntent::Restart {
            stream: "q".into(),
            params: query("down"),
        }
    );
    wait_for(&mut rx, |s| s.is_empty()).await.unwrap();

    end.send(FrameBuilder::new("q").upsert("2", json!({"name": "b"})).synced().build())
        .await;
    let snap = wait_for(&mut rx, |s| s.synced).await.unwrap();
    assert!(snap.row("1").is_none());
    assert_eq!(snap.cell("2", "name"), Some(&Cell::from(json!("b"))));
}

#[tokio::test(start_paused = true)]
async fn resubscribing_with_same_params_sends_nothing() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());

    mux.subscribe("ifaces", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    assert_eq!(subscribed_names(&end.take_intents(1).await), ["ifaces"]);

    mux.subscribe("ifaces", resource()).await.unwrap();
    mux.subscribe("alarms", resource()).await.unwrap();
    // The next intent is the new stream, not a repeat of the old one.
    assert_eq!(end.next_intent().await.unwrap().stream(), "alarms");
    assert!(end.drain_intents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_reissues_each_subscription_once_and_resets_views() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector.clone(), config());
    let mut state = mux.state_watch();

    mux.subscribe("ifaces", resource()).await.unwrap();
    mux.subscribe("alarms", query("sev>2")).await.unwrap();
    let mut end = ends.next().await.unwrap();
    assert!(wait_for_state(&mut state, &ConnectionState::Connected).await);
    assert_eq!(subscribed_names(&end.take_intents(2).await), ["alarms", "ifaces"]);

    let mut ifaces = mux.watch("ifaces").await.unwrap();
    let mut alarms = mux.watch("alarms").await.unwrap();
    end.send_all(backlog("ifaces", 3)).await;
    end.send_all(backlog("alarms", 2)).await;
    wait_for(&mut ifaces, |s| s.synced && s.len() == 3).await.unwrap();
    wait_for(&mut alarms, |s| s.synced && s.len() == 2).await.unwrap();
    status_until(&mux, "ifaces", |s| s.state == SubscriptionState::Active).await;

    end.hang_up();
    status_until(&mux, "ifaces", |s| s.state == SubscriptionState::Pending).await;

    let mut end = ends.next().await.unwrap();
    assert!(wait_for_state(&mut state, &ConnectionState::Connected).await);
    let reissued = end.take_intents(2).await;
    assert_eq!(subscribed_names(&reissued), ["alarms", "ifaces"]);
    assert!(end.drain_intents().is_empty(), "each stream is issued once");
    assert_eq!(connector.connect_count(), 2);

    // Views start over and are rebuilt from the replayed backlog.
    let cleared = wait_for(&mut ifaces, |s| s.is_empty()).await.unwrap();
    assert_eq!(cleared.state(), ViewState::Loading);
    assert!(cleared.columns.is_empty());
    wait_for(&mut alarms, |s| s.is_empty() && !s.synced).await.unwrap();

    end.send_all(backlog("ifaces", 1)).await;
    let rebuilt = wait_for(&mut ifaces, |s| s.synced).await.unwrap();
    assert_eq!(rebuilt.len(), 1);
    assert_eq!(rebuilt.columns, vec!["n".to_owned()]);
    status_until(&mux, "ifaces", |s| s.state == SubscriptionState::Active).await;
    assert_eq!(
        mux.status("alarms").await.unwrap().state,
        SubscriptionState::Pending
    );
}

#[tokio::test(start_paused = true)]
async fn frames_for_unknown_streams_are_dropped() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    mux.subscribe("ifaces", resource()).await.unwrap();
    let end = ends.next().await.unwrap();

    let mut rx = mux.watch("ifaces").await.unwrap();
    end.send(FrameBuilder::new("ghost").upsert("x", json!({"v": 1})).build())
        .await;
    end.send(FrameBuilder::new("ifaces").upsert("eth0", json!({"mtu": 1500})).build())
        .await;
    let snap = wait_for(&mut rx, |s| s.len() == 1).await.unwrap();
    assert!(snap.row("x").is_none());

    assert_eq!(mux.subscriptions().await, vec!["ifaces".to_owned()]);
    assert_eq!(
        mux.watch("ghost").await.unwrap_err(),
        StreamError::NotFound("ghost".into())
    );
}

#[tokio::test(start_paused = true)]
async fn remote_rejection_marks_the_stream_errored() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    mux.subscribe("bogus", resource()).await.unwrap();
    mux.subscribe("ifaces", resource()).await.unwrap();
    let end = ends.next().await.unwrap();

    end.send(InboundFrame::rejected("bogus", 404, "no such resource"))
        .await;
    let status = status_until(&mux, "bogus", |s| s.state == SubscriptionState::Errored).await;
    let err = status.last_error.unwrap();
    assert_eq!(err.code, 404);
    assert_eq!(err.stream, "bogus");
    assert!(mux.snapshot("bogus").await.unwrap().is_empty());

    // Other subscriptions are unaffected.
    end.send(FrameBuilder::new("ifaces").synced().build()).await;
    status_until(&mux, "ifaces", |s| s.state == SubscriptionState::Active).await;
    assert!(mux.is_connected());
}

#[tokio::test(start_paused = true)]
async fn resubscribing_a_rejected_stream_asks_again() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    let first = mux.subscribe("s", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(1).await;

    let mut rx = mux.watch("s").await.unwrap();
    end.send(FrameBuilder::new("s").upsert("old", json!({"v": 0})).build())
        .await;
    wait_for(&mut rx, |s| s.len() == 1).await.unwrap();
    end.send(InboundFrame::rejected("s", 503, "busy")).await;
    status_until(&mux, "s", |s| s.state == SubscriptionState::Errored).await;

    let again = mux.subscribe("s", resource()).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.generation, first.generation);
    assert_eq!(
        end.next_intent().await.unwrap(),
        ClientIntent::Subscribe {
            stream: "s".into(),
            params: resource(),
        }
    );
    assert_eq!(mux.status("s").await.unwrap().state, SubscriptionState::Pending);
    wait_for(&mut rx, |s| s.is_empty()).await.unwrap();

    end.send_all(backlog("s", 2)).await;
    let snap = wait_for(&mut rx, |s| s.synced).await.unwrap();
    assert_eq!(snap.len(), 2);
    assert!(snap.row("old").is_none());
    let status = status_until(&mux, "s", |s| s.state == SubscriptionState::Active).await;
    assert!(status.last_error.is_none());

    // Once healthy, the same subscribe is a no-op again.
    mux.subscribe("s", resource()).await.unwrap();
    mux.subscribe("t", resource()).await.unwrap();
    assert_eq!(end.next_intent().await.unwrap().stream(), "t");
}

#[tokio::test(start_paused = true)]
async fn malformed_rows_stay_local_to_their_stream() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector.clone(), config());
    mux.subscribe("a", resource()).await.unwrap();
    mux.subscribe("b", resource()).await.unwrap();
    let end = ends.next().await.unwrap();

    let mut a = mux.watch("a").await.unwrap();
    let mut b = mux.watch("b").await.unwrap();
    end.send(FrameBuilder::new("b").upsert("x", json!({"v": 1})).build())
        .await;
    wait_for(&mut b, |s| s.len() == 1).await.unwrap();

    let mixed = InboundFrame::from_json(
        r#"{"streamName": "a", "operation": {"upserts": [
            {"id": true, "fields": {"v": 0}},
            {"id": "bad", "fields": "not-an-object"},
            {"id": "ok", "fields": {"v": 1}}
        ]}}"#,
    )
    .unwrap();
    end.send(mixed).await;
    end.send(FrameBuilder::new("b").upsert("y", json!({"v": 2})).build())
        .await;

    let snap = wait_for(&mut a, |s| s.len() == 1).await.unwrap();
    assert_eq!(snap.columns, vec!["v".to_owned()]);
    assert_eq!(snap.cell("ok", "v"), Some(&Cell::from(json!(1))));
    assert_eq!(snap.diagnostics.len(), 2);
    assert_eq!(snap.diagnostics[0].row_id, "true");
    assert_eq!(snap.diagnostics[0].error, MalformedRowError::BadId { found: "boolean" });
    assert_eq!(snap.diagnostics[1].row_id, "bad");
    assert_eq!(
        snap.diagnostics[1].error,
        MalformedRowError::NotAnObject { found: "string" }
    );

    wait_for(&mut b, |s| s.len() == 2).await.unwrap();
    assert_eq!(mux.status("a").await.unwrap().state, SubscriptionState::Active);
    assert_eq!(mux.status("b").await.unwrap().state, SubscriptionState::Active);
    assert!(mux.is_connected());
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_workers_are_reaped() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    mux.subscribe("a", resource()).await.unwrap();
    mux.subscribe("b", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(2).await;
    assert_eq!(mux.dispatch_workers().await, 0);

    let mut a = mux.watch("a").await.unwrap();
    let mut b = mux.watch("b").await.unwrap();
    end.send(FrameBuilder::new("a").upsert("1", json!({})).build()).await;
    end.send(FrameBuilder::new("b").upsert("1", json!({})).build()).await;
    wait_for(&mut a, |s| s.len() == 1).await.unwrap();
    wait_for(&mut b, |s| s.len() == 1).await.unwrap();
    assert_eq!(mux.dispatch_workers().await, 2);

    mux.unsubscribe("a").await.unwrap();
    workers_until(&mux, 1).await;

    let narrowed = StreamParams::new(StreamKind::Resource).arg("path", "/interfaces/eth1");
    assert_eq!(mux.restart("b", narrowed).await.unwrap(), RestartMode::Resubscribed);
    workers_until(&mux, 0).await;

    end.send(FrameBuilder::new("b").upsert("2", json!({})).build()).await;
    wait_for(&mut b, |s| s.len() == 1).await.unwrap();
    assert_eq!(mux.dispatch_workers().await, 1);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_tears_down_and_drops_late_frames() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    mux.subscribe("ifaces", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(1).await;

    let mut rx = mux.watch("ifaces").await.unwrap();
    end.send(FrameBuilder::new("ifaces").upsert("eth0", json!({})).build())
        .await;
    wait_for(&mut rx, |s| s.len() == 1).await.unwrap();

    let closed = mux.unsubscribe("ifaces").await.unwrap().unwrap();
    assert_eq!(closed.state, SubscriptionState::Closed);
    assert_eq!(
        end.next_intent().await.unwrap(),
        ClientIntent::Unsubscribe {
            stream: "ifaces".into()
        }
    );

    // The snapshot channel closes once the view is gone.
    while rx.changed().await.is_ok() {}
    end.send(FrameBuilder::new("ifaces").upsert("late", json!({})).build())
        .await;
    assert!(!mux.is_subscribed("ifaces").await);
    assert!(mux.snapshot("ifaces").await.is_err());
    assert_eq!(mux.unsubscribe("ifaces").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_without_teardown_only_filters_locally() {
    let (connector, mut ends) = ScriptedConnector::without_teardown();
    let mux = StreamMultiplexer::new(connector, config());
    mux.subscribe("a", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(1).await;

    mux.unsubscribe("a").await.unwrap();
    mux.subscribe("b", resource()).await.unwrap();
    assert_eq!(
        end.next_intent().await.unwrap(),
        ClientIntent::Subscribe {
            stream: "b".into(),
            params: resource(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn restarting_a_resource_resubscribes_under_a_new_generation() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    let handle = mux.subscribe("ifaces", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(1).await;

    let mut rx = mux.watch("ifaces").await.unwrap();
    end.send_all(backlog("ifaces", 2)).await;
    wait_for(&mut rx, |s| s.synced).await.unwrap();

    let narrowed = StreamParams::new(StreamKind::Resource).arg("path", "/interfaces/eth0");
    let mode = mux.restart("ifaces", narrowed.clone()).await.unwrap();
    assert_eq!(mode, RestartMode::Resubscribed);
    assert_eq!(
        end.take_intents(2).await,
        vec![
            ClientIntent::Unsubscribe {
                stream: "ifaces".into()
            },
            ClientIntent::Subscribe {
                stream: "ifaces".into(),
                params: narrowed,
            },
        ]
    );
    let status = mux.status("ifaces").await.unwrap();
    assert!(status.generation > handle.generation);
    assert_eq!(status.state, SubscriptionState::Pending);
    wait_for(&mut rx, |s| s.is_empty() && !s.synced).await.unwrap();

    end.send(FrameBuilder::new("ifaces").upsert("eth0", json!({"up": true})).build())
        .await;
    let snap = wait_for(&mut rx, |s| s.len() == 1).await.unwrap();
    assert_eq!(snap.columns, vec!["up".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn restarting_a_query_happens_in_place() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    let handle = mux.subscribe("q", query("a")).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(1).await;

    assert_eq!(mux.restart("q", query("b")).await.unwrap(), RestartMode::InPlace);
    assert!(matches!(
        end.next_intent().await.unwrap(),
        ClientIntent::Restart { .. }
    ));
    assert_eq!(mux.status("q").await.unwrap().generation, handle.generation);
    assert_eq!(
        mux.restart("missing", query("x")).await.unwrap_err(),
        StreamError::NotFound("missing".into())
    );
}

#[tokio::test(start_paused = true)]
async fn connect_retries_with_backoff() {
    let (connector, mut ends) = ScriptedConnector::new();
    connector.refuse_next(2);
    let mux = StreamMultiplexer::new(connector.clone(), config());

    mux.connect().await.unwrap();
    assert!(mux.is_connected());
    assert_eq!(connector.connect_count(), 3);
    assert!(ends.try_next().is_some());

    // Already connected: resolves without another attempt.
    mux.connect().await.unwrap();
    assert_eq!(connector.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn bounded_retries_surface_unavailable() {
    let (connector, _ends) = ScriptedConnector::new();
    connector.refuse_next(100);
    let mux = StreamMultiplexer::new(
        connector.clone(),
        MultiplexerConfig {
            reconnect: ReconnectConfig {
                max_retries: Some(2),
                jitter: 0.0,
                ..ReconnectConfig::default()
            },
            ..MultiplexerConfig::default()
        },
    );

    let err = mux.connect().await.unwrap_err();
    assert_eq!(err, StreamError::Unavailable { attempts: 2 });
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(mux.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_waiting_but_keeps_the_subscription() {
    let (connector, _ends) = ScriptedConnector::new();
    connector.refuse_next(1000);
    let mux = StreamMultiplexer::new(connector, config());

    let token = CancellationToken::new();
    token.cancel();
    let err = mux
        .subscribe_with_cancel("ifaces", resource(), &token)
        .await
        .unwrap_err();
    assert_eq!(err, StreamError::Cancelled);
    assert!(mux.is_subscribed("ifaces").await);

    let token = CancellationToken::new();
    let waiter = {
        let mux = mux.clone();
        let token = token.clone();
        tokio::spawn(async move { mux.connect_with_cancel(&token).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    assert_eq!(waiter.await.unwrap(), Err(StreamError::Cancelled));
    assert_eq!(mux.connection_state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent_and_fails_pending_work() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector.clone(), config());
    mux.subscribe("ifaces", resource()).await.unwrap();
    let mut end = ends.next().await.unwrap();
    end.take_intents(1).await;
    let mut rx = mux.watch("ifaces").await.unwrap();

    mux.dispose().await;
    mux.dispose().await;
    assert_eq!(mux.connection_state(), ConnectionState::Disposed);
    assert!(end.next_intent().await.is_none(), "link dropped");
    assert!(rx.changed().await.is_err(), "views dropped");

    assert_eq!(
        mux.subscribe("x", resource()).await.unwrap_err(),
        StreamError::Disposed
    );
    assert_eq!(mux.connect().await.unwrap_err(), StreamError::Disposed);
    assert!(mux.subscriptions().await.is_empty());
    assert!(mux.status("ifaces").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn dispose_releases_connect_waiters() {
    let (connector, _ends) = ScriptedConnector::new();
    connector.refuse_next(1000);
    let mux = StreamMultiplexer::new(connector, config());
    let mut state = mux.state_watch();

    let waiter = {
        let mux = mux.clone();
        tokio::spawn(async move { mux.connect().await })
    };
    assert!(wait_for_state(&mut state, &ConnectionState::Connecting).await);
    mux.dispose().await;
    assert_eq!(waiter.await.unwrap(), Err(StreamError::Disposed));
}

#[tokio::test(start_paused = true)]
async fn snapshot_listeners_follow_a_stream_until_dropped() {
    let (connector, mut ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    mux.subscribe("ifaces", resource()).await.unwrap();
    let end = ends.next().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = Arc::clone(&seen);
        mux.on_snapshot_changed("ifaces", move |snap| {
            seen.lock().unwrap().push(snap.len());
        })
        .await
        .unwrap()
    };

    let mut rx = mux.watch("ifaces").await.unwrap();
    end.send(FrameBuilder::new("ifaces").upsert("a", json!({})).build())
        .await;
    wait_for(&mut rx, |s| s.len() == 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().unwrap().last(), Some(&1));

    drop(listener);
    end.send(FrameBuilder::new("ifaces").upsert("b", json!({})).build())
        .await;
    wait_for(&mut rx, |s| s.len() == 2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!seen.lock().unwrap().contains(&2));

    assert!(mux.on_snapshot_changed("nope", |_| {}).await.is_err());
}

#[tokio::test]
async fn ephemeral_names_do_not_collide() {
    let (connector, _ends) = ScriptedConnector::new();
    let mux = StreamMultiplexer::new(connector, config());
    let a = mux.ephemeral_name("query");
    let b = mux.clone().ephemeral_name("query");
    assert_ne!(a, b);
    assert!(a.starts_with("query-"));
}
