//! End-to-end request, fire-and-forget and event behavior over a live socket.

use std::time::Duration;

use chat_bridge::config::FailurePolicy;
use chat_bridge::ipc;
use chat_bridge::ipc::events::DISCONNECTED_EVENT;
use chat_bridge::ipc::server::watch_server;
use chat_bridge::protocol::codec::encode_frame;
use chat_bridge::protocol::framer::FrameCodec;
use chat_bridge::protocol::{
    CallArgs, Frame, Payload, RemoteErrorKind, Request, ERROR_EVENT, FIRE_AND_FORGET,
};
use chat_bridge::session::{Channel, Message};
use chat_bridge::AppError;
use futures_util::StreamExt;
use interprocess::local_socket::tokio::prelude::*;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};
use tokio_util::codec::FramedRead;

use super::test_helpers::{collect_events, next_event, start_bridge, BridgeOptions};

fn remote_kind(err: &AppError) -> RemoteErrorKind {
    err.remote()
        .unwrap_or_else(|| panic!("expected a remote error, got {err}"))
        .kind
}

#[tokio::test]
async fn request_returns_logged_in_user() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        ..BridgeOptions::default()
    });
    assert!(bridge.socket.starts_with(bridge.dir.path()));
    let client = bridge.client().await;

    let user = client.request("session.user", CallArgs::new()).await.unwrap();
    assert_eq!(user, json!("alice"));

    let typed: Option<String> = client
        .request_as("session.user", CallArgs::new())
        .await
        .unwrap();
    assert_eq!(typed.as_deref(), Some("alice"));
}

#[tokio::test]
async fn fire_and_forget_connect_is_observed_through_ready_event() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        ..BridgeOptions::default()
    });
    let client = bridge.client().await;
    let mut ready = collect_events(&client, "ready");

    client
        .fire_and_forget("session.connect", CallArgs::new())
        .await
        .unwrap();

    let event = next_event(&mut ready).await;
    assert_eq!(event.payload, vec![json!("alice")]);
    assert!(!bridge.session.is_closed());
}

#[tokio::test]
async fn failed_call_does_not_poison_the_connection() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        ..BridgeOptions::default()
    });
    let client = bridge.client().await;
    client.request("session.connect", CallArgs::new()).await.unwrap();

    let err = client
        .request("session.delete_message", CallArgs::new().arg(9999))
        .await
        .unwrap_err();
    assert_eq!(remote_kind(&err), RemoteErrorKind::Raised);

    let user = client.request("session.user", CallArgs::new()).await.unwrap();
    assert_eq!(user, json!("alice"));
}

#[tokio::test]
async fn every_client_receives_broadcast_events() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        ..BridgeOptions::default()
    });
    let first = bridge.client().await;
    let second = bridge.client().await;
    let mut first_messages = collect_events(&first, "message");
    let mut second_messages = collect_events(&second, "message");
    bridge.wait_for_connections(2).await;

    first.request("session.connect", CallArgs::new()).await.unwrap();
    let channel: Channel = first
        .request_as("session.create_channel", CallArgs::new().arg("general"))
        .await
        .unwrap();
    let sent: Message = first
        .request_as(
            "session.send_message",
            CallArgs::new().arg(channel.id).kwarg("content", "hello"),
        )
        .await
        .unwrap();

    for rx in [&mut first_messages, &mut second_messages] {
        let event = next_event(rx).await;
        assert_eq!(event.payload[0]["id"], json!(sent.id));
        assert_eq!(event.payload[0]["content"], json!("hello"));
    }
}

#[tokio::test]
async fn unknown_verb_is_unroutable() {
    let bridge = start_bridge(BridgeOptions::default());
    let client = bridge.client().await;

    let err = client
        .request("session.does_not_exist", CallArgs::new())
        .await
        .unwrap_err();
    assert_eq!(remote_kind(&err), RemoteErrorKind::UnroutableVerb);

    let err = client.request("session", CallArgs::new()).await.unwrap_err();
    assert_eq!(remote_kind(&err), RemoteErrorKind::UnroutableVerb);
}

#[tokio::test]
async fn concurrent_requests_are_correlated_by_id() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        ..BridgeOptions::default()
    });
    let client = bridge.client().await;
    for n in 0..5 {
        client
            .request("session.create_channel", CallArgs::new().arg(format!("c{n}")))
            .await
            .unwrap();
    }

    let calls = (1..=5_u64).map(|id| {
        let client = client.clone();
        tokio::spawn(async move {
            let channel: Channel = client
                .request_as("session.get_channel", CallArgs::new().arg(id))
                .await
                .unwrap();
            (id, channel)
        })
    });
    for call in calls.collect::<Vec<_>>() {
        let (id, channel) = call.await.unwrap();
        assert_eq!(channel.id, id);
        assert_eq!(channel.name, format!("c{}", id - 1));
    }
}

#[tokio::test]
async fn fire_and_forget_never_gets_a_response_frame() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        ..BridgeOptions::default()
    });
    let stream = ipc::dial(&bridge.socket).await.unwrap();
    let (recv, mut send) = stream.split();
    let mut frames = FramedRead::new(recv, FrameCodec::new());

    let fire = Frame::Request(Request {
        id: FIRE_AND_FORGET,
        verb: "session.delete_message".into(),
        args: CallArgs::new().arg(1),
    });
    send.write_all(&encode_frame(&fire).unwrap()).await.unwrap();

    // The failure is broadcast, never answered.
    let frame = timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    let Frame::Event(event) = frame else {
        panic!("expected an error event, got {frame:?}");
    };
    assert_eq!(event.name, ERROR_EVENT);
    assert_eq!(event.payload[0]["kind"], json!(RemoteErrorKind::Raised.as_str()));

    let ask = Frame::Request(Request {
        id: 5,
        verb: "session.user".into(),
        args: CallArgs::new(),
    });
    send.write_all(&encode_frame(&ask).unwrap()).await.unwrap();

    let frame = timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    let Frame::Response(response) = frame else {
        panic!("expected a response, got {frame:?}");
    };
    assert_eq!(response.id, 5);
    assert_eq!(response.payload, Payload::Value(json!("alice")));

    assert!(
        timeout(Duration::from_millis(200), frames.next()).await.is_err(),
        "no further frames expected"
    );
}

#[tokio::test]
async fn log_policy_keeps_fire_and_forget_failures_quiet() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        policy: FailurePolicy::Log,
        ..BridgeOptions::default()
    });
    let client = bridge.client().await;
    let mut errors = collect_events(&client, ERROR_EVENT);

    client
        .fire_and_forget("session.delete_message", CallArgs::new().arg(1))
        .await
        .unwrap();
    let user = client.request("session.user", CallArgs::new()).await.unwrap();
    assert_eq!(user, json!("alice"));

    assert!(
        timeout(Duration::from_millis(200), errors.recv()).await.is_err(),
        "log policy must not broadcast"
    );
}

#[tokio::test]
async fn pending_calls_fail_when_the_daemon_goes_away() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        latency: Duration::from_secs(5),
        ..BridgeOptions::default()
    });
    let client = bridge.client().await;
    let mut disconnected = collect_events(&client, DISCONNECTED_EVENT);

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.request("session.connect", CallArgs::new()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    bridge.ct.cancel();
    timeout(Duration::from_secs(2), async {
        while !bridge.server.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("accept loop stopped");

    for call in pending {
        let result = timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
        assert!(
            matches!(result, Err(AppError::ConnectionLost(_))),
            "got {result:?}"
        );
    }
    next_event(&mut disconnected).await;
    assert!(client.is_closed());

    let err = client
        .request("session.user", CallArgs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConnectionLost(_)));
    let err = client
        .fire_and_forget("session.user", CallArgs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConnectionLost(_)));
}

#[tokio::test]
async fn closing_the_client_fails_its_pending_calls() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        latency: Duration::from_secs(5),
        ..BridgeOptions::default()
    });
    let client = bridge.client().await;

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.request("session.connect", CallArgs::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.close();
    let result = timeout(Duration::from_secs(2), waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(AppError::ConnectionLost(_))));
    timeout(Duration::from_secs(2), client.closed()).await.unwrap();
    assert!(client.is_closed());

    bridge.wait_for_connections(0).await;
}

#[tokio::test]
async fn slow_operation_does_not_block_other_clients() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        latency: Duration::from_millis(800),
        ..BridgeOptions::default()
    });
    let slow_client = bridge.client().await;
    let fast_client = bridge.client().await;

    let slow = tokio::spawn(async move {
        slow_client
            .request("session.connect", CallArgs::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let user = fast_client
        .request("session.user", CallArgs::new())
        .await
        .unwrap();
    assert_eq!(user, json!("alice"));
    assert!(started.elapsed() < Duration::from_millis(400));

    timeout(Duration::from_secs(3), slow)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn events_emitted_by_the_daemon_reach_catch_all_handlers() {
    let bridge = start_bridge(BridgeOptions::default());
    let client = bridge.client().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _all = client.on_any(move |event| {
        let _ = tx.send(event);
        std::future::ready(Ok(()))
    });
    bridge.wait_for_connections(1).await;

    assert_eq!(bridge.broadcaster.emit("custom", vec![json!(1), json!("two")]), 1);

    let event = next_event(&mut rx).await;
    assert_eq!(event.name, "custom");
    assert_eq!(event.payload, vec![json!(1), json!("two")]);
}

#[tokio::test]
async fn server_task_failure_is_broadcast_to_every_client() {
    let bridge = start_bridge(BridgeOptions::default());
    let first = bridge.client().await;
    let second = bridge.client().await;
    let mut first_errors = collect_events(&first, ERROR_EVENT);
    let mut second_errors = collect_events(&second, ERROR_EVENT);
    bridge.wait_for_connections(2).await;

    let failing = tokio::spawn(async { panic!("accept loop fault") });
    let failure = watch_server(failing, bridge.broadcaster.clone())
        .await
        .expect("a failed task is reported");
    assert_eq!(failure.kind, RemoteErrorKind::Panicked);

    for rx in [&mut first_errors, &mut second_errors] {
        let event = next_event(rx).await;
        assert_eq!(event.payload[0]["kind"], json!(RemoteErrorKind::Panicked.as_str()));
    }
}

#[tokio::test]
async fn clean_server_stop_is_not_broadcast() {
    let bridge = start_bridge(BridgeOptions::default());
    let client = bridge.client().await;
    let mut errors = collect_events(&client, ERROR_EVENT);
    bridge.wait_for_connections(1).await;

    let finished = tokio::spawn(async {});
    assert!(watch_server(finished, bridge.broadcaster.clone()).await.is_none());
    assert!(
        timeout(Duration::from_millis(200), errors.recv()).await.is_err(),
        "clean stop must not broadcast"
    );
}

#[tokio::test]
async fn half_closed_client_still_receives_pending_responses() {
    let bridge = start_bridge(BridgeOptions {
        user: Some("alice".into()),
        latency: Duration::from_millis(300),
        ..BridgeOptions::default()
    });
    let stream = ipc::dial(&bridge.socket).await.unwrap();
    let (recv, mut send) = stream.split();
    let mut frames = FramedRead::new(recv, FrameCodec::new());

    let connect = Frame::Request(Request {
        id: 1,
        verb: "session.connect".into(),
        args: CallArgs::new(),
    });
    send.write_all(&encode_frame(&connect).unwrap()).await.unwrap();
    send.shutdown().await.unwrap();

    let response = timeout(Duration::from_secs(2), async {
        while let Some(frame) = frames.next().await {
            if let Frame::Response(response) = frame.unwrap().unwrap() {
                return response;
            }
        }
        panic!("stream ended before the response arrived");
    })
    .await
    .unwrap();
    assert_eq!(response.id, 1);
    assert!(matches!(response.payload, Payload::Value(_)), "{response:?}");
}
