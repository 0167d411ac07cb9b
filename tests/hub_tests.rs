//! End-to-end hub tests over a scripted engine.

use std::time::Duration;

use tokio::sync::mpsc;

use ccsdk_gateway::engine::EngineEvent;
use ccsdk_gateway::hub::GatewayError;
use ccsdk_gateway::settings::GatewayConfig;
use ccsdk_gateway::store::MessageType;
use ccsdk_gateway::ws::ServerEvent;

mod common;
use common::{init_event, result_event, simple_turn, test_context, test_context_with, FakeEngine};

async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("subscriber channel closed")
}

/// Wait for the turn runner to persist the idle state after its terminal
/// frame was broadcast.
async fn wait_persisted_idle(ctx: &common::TestContext, session_id: &str) {
    for _ in 0..50 {
        if let Some(record) = ctx.state.store.get_session(session_id).await.unwrap() {
            if !record.is_active {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never settled to idle", session_id);
}

/// Drain frames until a terminal one (`result`, `cancelled` or `error`).
async fn collect_turn(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut frames = Vec::new();
    loop {
        let event = next_event(rx).await;
        let terminal = matches!(
            event,
            ServerEvent::Result { .. } | ServerEvent::Cancelled { .. } | ServerEvent::Error { .. }
        );
        frames.push(event);
        if terminal {
            break;
        }
    }
    frames
}

#[tokio::test]
async fn test_single_turn_event_order_and_persistence() {
    let engine = FakeEngine::new();
    engine.push_script(simple_turn("eng-1", "Hello!"));
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;

    // Snapshot arrives on subscribe.
    match next_event(&mut rx).await {
        ServerEvent::SessionInfo { data } => assert_eq!(data.id, session.id()),
        other => panic!("expected session_info, got {:?}", other),
    }

    session.submit("hi").await.unwrap();
    let frames = collect_turn(&mut rx).await;

    assert!(matches!(
        &frames[0],
        ServerEvent::System { subtype, .. } if subtype == "init"
    ));
    assert!(matches!(
        &frames[1],
        ServerEvent::AssistantMessage { content, .. } if content == "Hello!"
    ));
    match &frames[2] {
        ServerEvent::Result {
            success,
            result,
            cost,
            ..
        } => {
            assert!(*success);
            assert_eq!(result.as_deref(), Some("Hello!"));
            assert_eq!(*cost, Some(0.01));
        }
        other => panic!("expected result, got {:?}", other),
    }

    wait_persisted_idle(&ctx, session.id()).await;

    // Persisted: user, system(init), assistant, result, and the counter
    // matches the row count.
    let messages = ctx.state.store.list_messages(session.id(), 100).await.unwrap();
    let types: Vec<MessageType> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(
        types,
        vec![
            MessageType::User,
            MessageType::System,
            MessageType::Assistant,
            MessageType::Result,
        ]
    );

    let record = ctx.state.store.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(record.message_count, 4);
    assert!(!record.is_active);
    assert_eq!(record.engine_session_id.as_deref(), Some("eng-1"));

    let result_row = &messages[3];
    assert_eq!(result_row.subtype.as_deref(), Some("success"));
    assert_eq!(result_row.cost, Some(0.01));
    assert_eq!(result_row.duration, Some(5));
}

#[tokio::test]
async fn test_sequential_prompts_keep_order() {
    let engine = FakeEngine::new();
    engine.push_script(simple_turn("eng-1", "first"));
    engine.push_script(simple_turn("eng-1", "second"));
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await; // session_info

    session.submit("one").await.unwrap();
    session.submit("two").await.unwrap();

    let first = collect_turn(&mut rx).await;
    let second = collect_turn(&mut rx).await;
    assert!(matches!(
        first.last(),
        Some(ServerEvent::Result { result: Some(r), .. }) if r == "first"
    ));
    assert!(matches!(
        second.last(),
        Some(ServerEvent::Result { result: Some(r), .. }) if r == "second"
    ));

    // Two user rows and two terminals, terminals in submission order.
    let messages = ctx.state.store.list_messages(session.id(), 100).await.unwrap();
    let users: Vec<_> = messages
        .iter()
        .filter(|m| m.message_type == MessageType::User)
        .collect();
    let results: Vec<_> = messages
        .iter()
        .filter(|m| m.message_type == MessageType::Result)
        .collect();
    assert_eq!(users.len(), 2);
    assert_eq!(results.len(), 2);
    assert_eq!(users[0].content.as_deref(), Some("one"));
    assert_eq!(users[1].content.as_deref(), Some("two"));
    assert_eq!(results[0].content.as_deref(), Some("first"));
    assert_eq!(results[1].content.as_deref(), Some("second"));

    // (timestamp, id) strictly increases in insertion order.
    for pair in messages.windows(2) {
        assert!((pair[0].timestamp, pair[0].id) < (pair[1].timestamp, pair[1].id));
    }

    // Both turns ran on one session; the second resumed the first's token.
    let calls = ctx.engine.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].resume_token.is_none());
    assert_eq!(calls[1].resume_token.as_deref(), Some("eng-1"));
}

#[tokio::test]
async fn test_end_conversation_clears_resume_token() {
    let engine = FakeEngine::new();
    engine.push_script(simple_turn("eng-1", "a"));
    engine.push_script(simple_turn("eng-2", "b"));
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await;

    session.submit("one").await.unwrap();
    let _ = collect_turn(&mut rx).await;

    session.end_conversation().await;
    session.submit("two").await.unwrap();
    let _ = collect_turn(&mut rx).await;

    let calls = ctx.engine.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].resume_token.is_none());
}

#[tokio::test]
async fn test_cancel_mid_turn() {
    let engine = FakeEngine::with_delay(Duration::from_millis(50));
    engine.push_script(vec![
        Ok(init_event("eng-1")),
        Ok(EngineEvent::Assistant {
            text: "thinking...".to_string(),
        }),
        Ok(EngineEvent::Assistant {
            text: "still thinking...".to_string(),
        }),
        Ok(result_event("never delivered")),
    ]);
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await;

    session.submit("long task").await.unwrap();

    // Let the first event land, then cancel.
    match next_event(&mut rx).await {
        ServerEvent::System { subtype, .. } => assert_eq!(subtype, "init"),
        other => panic!("expected init, got {:?}", other),
    }
    session.cancel().await;

    let mut saw_cancelling = false;
    loop {
        match next_event(&mut rx).await {
            ServerEvent::Cancelling { .. } => saw_cancelling = true,
            ServerEvent::Cancelled { .. } => break,
            ServerEvent::AssistantMessage { .. } => {}
            other => panic!("unexpected frame during cancel: {:?}", other),
        }
    }
    assert!(saw_cancelling);

    // The session settles back to idle and persists it.
    wait_persisted_idle(&ctx, session.id()).await;
    assert!(session.is_idle().await);

    // Cancel while idle is a no-op.
    session.cancel().await;
    assert!(session.is_idle().await);
}

#[tokio::test]
async fn test_engine_failure_emits_error_frame() {
    let engine = FakeEngine::new();
    engine.push_script(vec![
        Ok(init_event("eng-1")),
        Err("model exploded".to_string()),
    ]);
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await;

    session.submit("boom").await.unwrap();
    let frames = collect_turn(&mut rx).await;

    match frames.last() {
        Some(ServerEvent::Error { error, session_id }) => {
            assert!(error.contains("model exploded"));
            assert_eq!(session_id.as_deref(), Some(session.id()));
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    // The init still captured the resume token; the error is persisted; the
    // session is idle again.
    wait_persisted_idle(&ctx, session.id()).await;
    let record = ctx.state.store.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(record.engine_session_id.as_deref(), Some("eng-1"));
    assert!(!record.is_active);

    let messages = ctx.state.store.list_messages(session.id(), 100).await.unwrap();
    assert!(messages
        .iter()
        .any(|m| m.message_type == MessageType::Error));
}

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let ctx = test_context().await;
    let session = ctx.state.hub.get_or_create(None).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx.clone()).await;
    session.subscribe("client-a", tx).await;

    // Exactly one snapshot for the two subscribes.
    let _ = next_event(&mut rx).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
    assert_eq!(session.subscriber_count(), 1);
}

#[tokio::test]
async fn test_fanout_reaches_all_subscribers() {
    let engine = FakeEngine::new();
    engine.push_script(simple_turn("eng-1", "broadcast"));
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    let mut receivers = Vec::new();
    for i in 0..5 {
        let (tx, mut rx) = mpsc::channel(64);
        session.subscribe(&format!("client-{i}"), tx).await;
        let _ = next_event(&mut rx).await; // snapshot
        receivers.push(rx);
    }

    session.submit("go").await.unwrap();

    for rx in receivers.iter_mut() {
        let frames = collect_turn(rx).await;
        assert_eq!(frames.len(), 3); // init, assistant, result
    }
}

#[tokio::test]
async fn test_queue_backpressure() {
    let engine = FakeEngine::with_delay(Duration::from_secs(30));
    engine.push_script(vec![Ok(init_event("eng-1"))]);
    let config = GatewayConfig {
        queue_capacity: 1,
        ..GatewayConfig::default()
    };
    let ctx = test_context_with(engine, config).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();
    session.submit("running").await.unwrap();

    // Give the runner time to dequeue the first prompt and block on the
    // engine, so the queue slot frees up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.submit("queued").await.unwrap();
    let err = session.submit("overflow").await.unwrap_err();
    assert!(matches!(err, GatewayError::Backpressure));

    session.cleanup().await;
}

#[tokio::test]
async fn test_submit_after_cleanup_is_gone() {
    let ctx = test_context().await;
    let session = ctx.state.hub.get_or_create(None).await.unwrap();

    session.cleanup().await;
    let err = session.submit("too late").await.unwrap_err();
    assert!(matches!(err, GatewayError::Gone));
}

#[tokio::test]
async fn test_idle_reclamation_preserves_history() {
    let engine = FakeEngine::new();
    engine.push_script(simple_turn("eng-1", "hello"));
    let config = GatewayConfig {
        idle_grace_ms: 50,
        ..GatewayConfig::default()
    };
    let ctx = test_context_with(engine, config).await;

    let session = ctx.state.hub.get_or_create(Some("y")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await;
    session.submit("hi").await.unwrap();
    let _ = collect_turn(&mut rx).await;

    session.unsubscribe("client-a");
    ctx.state.hub.schedule_idle_check("y");

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Gone from memory, still on disk.
    assert!(ctx.state.hub.get("y").is_none());
    let record = ctx.state.store.get_session("y").await.unwrap().unwrap();
    assert_eq!(record.message_count, 4);
    let messages = ctx.state.store.list_messages("y", 100).await.unwrap();
    assert_eq!(messages.len(), 4);
}

#[tokio::test]
async fn test_resubscribe_cancels_reclamation() {
    let config = GatewayConfig {
        idle_grace_ms: 100,
        ..GatewayConfig::default()
    };
    let ctx = test_context_with(FakeEngine::new(), config).await;

    let session = ctx.state.hub.get_or_create(Some("y")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await;

    session.unsubscribe("client-a");
    ctx.state.hub.schedule_idle_check("y");

    // Re-subscribe inside the grace window.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let (tx2, mut rx2) = mpsc::channel(64);
    session.subscribe("client-b", tx2).await;
    let _ = next_event(&mut rx2).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.state.hub.get("y").is_some());
}

#[tokio::test]
async fn test_rehydration_after_reclamation_resumes() {
    let engine = FakeEngine::new();
    engine.push_script(simple_turn("eng-42", "first"));
    engine.push_script(simple_turn("eng-42", "again"));
    let config = GatewayConfig {
        idle_grace_ms: 50,
        ..GatewayConfig::default()
    };
    let ctx = test_context_with(engine, config).await;

    let session = ctx.state.hub.get_or_create(Some("x")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-a", tx).await;
    let _ = next_event(&mut rx).await;
    session.submit("hi").await.unwrap();
    let _ = collect_turn(&mut rx).await;

    session.unsubscribe("client-a");
    ctx.state.hub.schedule_idle_check("x");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.state.hub.get("x").is_none());

    // Re-reference the same id: the persisted resume token is rehydrated.
    let session = ctx.state.hub.get_or_create(Some("x")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("client-c", tx).await;
    let _ = next_event(&mut rx).await;
    session.submit("again").await.unwrap();
    let _ = collect_turn(&mut rx).await;

    let calls = ctx.engine.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].resume_token.as_deref(), Some("eng-42"));
}

#[tokio::test]
async fn test_get_or_create_is_stable_per_id() {
    let ctx = test_context().await;

    let a = ctx.state.hub.get_or_create(Some("same")).await.unwrap();
    let b = ctx.state.hub.get_or_create(Some("same")).await.unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(ctx.state.hub.list().await.len(), 1);

    let c = ctx.state.hub.get_or_create(None).await.unwrap();
    assert_ne!(c.id(), a.id());
    assert!(ctx.state.hub.get(c.id()).is_some());
    assert!(ctx.state.hub.get("missing").is_none());
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped_without_stalling_others() {
    let engine = FakeEngine::new();
    // Enough events to overflow a capacity-1 subscriber buffer.
    engine.push_script(vec![
        Ok(init_event("eng-1")),
        Ok(EngineEvent::Assistant { text: "a".to_string() }),
        Ok(EngineEvent::Assistant { text: "b".to_string() }),
        Ok(EngineEvent::Assistant { text: "c".to_string() }),
        Ok(result_event("done")),
    ]);
    let ctx = test_context_with(engine, GatewayConfig::default()).await;

    let session = ctx.state.hub.get_or_create(None).await.unwrap();

    // The slow client never drains its single-slot buffer.
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    session.subscribe("slow", slow_tx).await;

    let (tx, mut rx) = mpsc::channel(64);
    session.subscribe("healthy", tx).await;
    let _ = next_event(&mut rx).await;

    session.submit("go").await.unwrap();
    let frames = collect_turn(&mut rx).await;
    assert_eq!(frames.len(), 5);

    // The slow subscriber was evicted along the way.
    assert_eq!(session.subscriber_count(), 1);
}

#[tokio::test]
async fn test_hub_shutdown_stops_sessions() {
    let ctx = test_context().await;
    ctx.state.hub.get_or_create(Some("a")).await.unwrap();
    ctx.state.hub.get_or_create(Some("b")).await.unwrap();
    assert_eq!(ctx.state.hub.list().await.len(), 2);

    ctx.state.hub.shutdown().await;
    assert_eq!(ctx.state.hub.list().await.len(), 0);

    // Rows survive shutdown.
    assert!(ctx.state.store.get_session("a").await.unwrap().is_some());
    assert!(ctx.state.store.get_session("b").await.unwrap().is_some());
}
