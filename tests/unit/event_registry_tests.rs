//! Publish/subscribe registry used by the client endpoint.

use std::time::Duration;

use chat_bridge::ipc::events::EventRegistry;
use chat_bridge::protocol::Event;
use chat_bridge::AppError;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

type Ready = std::future::Ready<chat_bridge::Result<()>>;

fn forward_to(
    tx: mpsc::UnboundedSender<(String, Event)>,
    tag: &'static str,
) -> impl Fn(Event) -> Ready + Send + Sync + 'static {
    move |event| {
        let _ = tx.send((tag.to_owned(), event));
        std::future::ready(Ok(()))
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(String, Event)>) -> (String, Event) {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler ran in time")
        .expect("channel open")
}

#[tokio::test]
async fn both_handlers_for_a_name_run_once() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _a = registry.subscribe("message", forward_to(tx.clone(), "a"));
    let _b = registry.subscribe("message", forward_to(tx, "b"));

    assert_eq!(registry.dispatch("message", vec![json!("hello")]), 2);

    let mut tags = vec![next(&mut rx).await.0, next(&mut rx).await.0];
    tags.sort();
    assert_eq!(tags, vec!["a", "b"]);
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "each handler runs exactly once"
    );
}

#[tokio::test]
async fn handlers_only_see_their_event_name() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ready = registry.subscribe("ready", forward_to(tx, "ready"));

    assert_eq!(registry.dispatch("message", Vec::new()), 0);
    assert_eq!(registry.dispatch("ready", vec![json!("alice")]), 1);

    let (_, event) = next(&mut rx).await;
    assert_eq!(event.name, "ready");
    assert_eq!(event.payload, vec![json!("alice")]);
}

#[tokio::test]
async fn failing_and_panicking_handlers_do_not_affect_others() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _failing = registry.subscribe("message", |_event| {
        std::future::ready(Err::<(), _>(AppError::Io("handler failed".into())))
    });
    let _panicking = registry.subscribe("message", |_event| -> Ready {
        panic!("handler panicked");
    });
    let _good = registry.subscribe("message", forward_to(tx, "good"));

    for round in 0..2 {
        assert_eq!(registry.dispatch("message", vec![json!(round)]), 3);
        let (tag, event) = next(&mut rx).await;
        assert_eq!(tag, "good");
        assert_eq!(event.payload, vec![json!(round)]);
    }
}

#[tokio::test]
async fn unsubscribe_removes_only_that_handler() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = registry.subscribe("message", forward_to(tx.clone(), "first"));
    let _second = registry.subscribe("message", forward_to(tx, "second"));
    assert_eq!(registry.handler_count("message"), 2);

    assert_eq!(first.name(), "message");
    assert!(first.unsubscribe());
    assert_eq!(registry.handler_count("message"), 1);

    registry.dispatch("message", Vec::new());
    assert_eq!(next(&mut rx).await.0, "second");
}

#[tokio::test]
async fn catch_all_handler_sees_every_name() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _all = registry.subscribe_any(forward_to(tx, "all"));

    registry.dispatch("ready", Vec::new());
    registry.dispatch("disconnected", Vec::new());

    let mut names = vec![next(&mut rx).await.1.name, next(&mut rx).await.1.name];
    names.sort();
    assert_eq!(names, vec!["disconnected", "ready"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_handler_sees_events_in_dispatch_order() {
    const COUNT: u64 = 2000;
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ordered = registry.subscribe("message", forward_to(tx, "ordered"));

    for n in 0..COUNT {
        assert_eq!(registry.dispatch("message", vec![json!(n)]), 1);
    }

    for expected in 0..COUNT {
        let (_, event) = next(&mut rx).await;
        assert_eq!(event.payload, vec![json!(expected)]);
    }
}

#[tokio::test]
async fn handler_keeps_receiving_after_its_own_failures() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _flaky = registry.subscribe("message", move |event: Event| -> Ready {
        match event.payload[0].as_u64() {
            Some(0) => panic!("first event panics"),
            Some(1) => std::future::ready(Err(AppError::Io("second event fails".into()))),
            _ => {
                let _ = tx.send(("flaky".to_owned(), event));
                std::future::ready(Ok(()))
            }
        }
    });

    for n in 0..3 {
        registry.dispatch("message", vec![json!(n)]);
    }
    let (_, event) = next(&mut rx).await;
    assert_eq!(event.payload, vec![json!(2)]);
}

#[tokio::test]
async fn event_named_like_the_wildcard_reaches_catch_all_once() {
    let registry = EventRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _all = registry.subscribe_any(forward_to(tx, "all"));

    assert_eq!(registry.dispatch("*", Vec::new()), 1);
    assert_eq!(next(&mut rx).await.1.name, "*");
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}
