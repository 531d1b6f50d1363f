//! End-to-end delivery scenarios exercised through the library: ingress,
//! store, registry and delivery engine wired together as in the binary, with
//! in-process connection pairs standing in for WebSocket sessions.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use message_relay::api::{router, AppState};
use message_relay::delivery::DeliveryEngine;
use message_relay::protocol::ServerEvent;
use message_relay::registry::{ConnectionHandle, ConnectionRegistry};
use message_relay::store::MessageStore;

fn app_state(store: MessageStore, ack_timeout: Duration) -> AppState {
    let registry = ConnectionRegistry::new();
    let engine = DeliveryEngine::new(store.clone(), registry.clone(), ack_timeout, None);
    AppState {
        store,
        registry,
        engine,
        transformer: None,
        ping_interval: Duration::from_secs(30),
        ping_timeout: Duration::from_secs(10),
    }
}

fn submit(recipient: &str, text: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/messages")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"recipient": recipient, "text": text}).to_string(),
        ))
        .unwrap()
}

fn message_id(event: &ServerEvent) -> i64 {
    match event {
        ServerEvent::NewMessage { id, .. } => *id,
        other => panic!("expected new_message, got {other:?}"),
    }
}

#[tokio::test]
async fn offline_submit_then_connect_replay_confirm() {
    let state = app_state(MessageStore::open_in_memory().unwrap(), Duration::from_secs(5));

    // u1 is offline; the message lands in the store only
    let response = router(state.clone()).oneshot(submit("u1", "hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let queued = state.store.fetch_unprocessed("u1").unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].text, "hello");
    let id = queued[0].id;

    // u1 connects: the backlog is replayed
    let (conn, mut rx) = ConnectionHandle::pair("u1");
    state.registry.register(conn);
    let replay = {
        let engine = state.engine.clone();
        tokio::spawn(async move { engine.deliver_all("u1").await })
    };

    let event = rx.recv().await.unwrap();
    assert_eq!(message_id(&event), id);

    // confirm flips the durable flag, permanently
    state.engine.on_ack("u1", id).unwrap();
    replay.await.unwrap();
    assert!(state.store.fetch_unprocessed("u1").unwrap().is_empty());
}

#[tokio::test]
async fn ack_timeout_then_reconnect_resends() {
    let state = app_state(
        MessageStore::open_in_memory().unwrap(),
        Duration::from_millis(80),
    );

    let (conn, mut rx) = ConnectionHandle::pair("u1");
    state.registry.register(conn.clone());

    let response = router(state.clone()).oneshot(submit("u1", "x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // immediate push of the new id
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let id = message_id(&event);

    // no confirm arrives: the pending ack is cleared, the store is untouched
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.engine.pending_count(), 0);
    assert!(state.store.is_unprocessed(id).unwrap());

    // disconnect and reconnect: the message is resent
    state.registry.remove(&conn);
    drop(rx);
    let (conn, mut rx) = ConnectionHandle::pair("u1");
    state.registry.register(conn);
    let replay = {
        let engine = state.engine.clone();
        tokio::spawn(async move { engine.deliver_all("u1").await })
    };

    let event = rx.recv().await.unwrap();
    assert_eq!(message_id(&event), id);
    state.engine.on_ack("u1", id).unwrap();
    replay.await.unwrap();
}

#[tokio::test]
async fn ordering_holds_across_backlog_and_new_traffic() {
    let state = app_state(MessageStore::open_in_memory().unwrap(), Duration::from_secs(5));
    let app = router(state.clone());

    for text in ["one", "two", "three"] {
        app.clone().oneshot(submit("u1", text)).await.unwrap();
    }

    let (conn, mut rx) = ConnectionHandle::pair("u1");
    state.registry.register(conn);
    {
        let engine = state.engine.clone();
        tokio::spawn(async move { engine.deliver_all("u1").await });
    }

    let mut previous = 0;
    for _ in 0..3 {
        let event = rx.recv().await.unwrap();
        let id = message_id(&event);
        assert!(id > previous, "ids must be strictly ascending");
        previous = id;
        state.engine.on_ack("u1", id).unwrap();
    }
    assert!(state.store.fetch_unprocessed("u1").unwrap().is_empty());
}

#[tokio::test]
async fn process_restart_recovers_unprocessed_messages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.db");

    // first process lifetime: accept a message, deliver it, never get an ack
    let id = {
        let state = app_state(MessageStore::open(&path).unwrap(), Duration::from_millis(50));
        let response = router(state.clone()).oneshot(submit("u1", "survive me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let (conn, mut rx) = ConnectionHandle::pair("u1");
        state.registry.register(conn);
        {
            let engine = state.engine.clone();
            tokio::spawn(async move { engine.deliver_all("u1").await });
        }
        message_id(&rx.recv().await.unwrap())
        // registry and pending-ack state die with this scope
    };

    // second process lifetime: fresh in-memory state, same database
    let state = app_state(MessageStore::open(&path).unwrap(), Duration::from_secs(5));
    let (conn, mut rx) = ConnectionHandle::pair("u1");
    state.registry.register(conn);
    let replay = {
        let engine = state.engine.clone();
        tokio::spawn(async move { engine.deliver_all("u1").await })
    };

    let event = rx.recv().await.unwrap();
    assert_eq!(message_id(&event), id);
    state.engine.on_ack("u1", id).unwrap();
    replay.await.unwrap();
    assert!(state.store.fetch_unprocessed("u1").unwrap().is_empty());
}

#[tokio::test]
async fn confirm_excludes_message_permanently() {
    let state = app_state(MessageStore::open_in_memory().unwrap(), Duration::from_secs(5));

    router(state.clone()).oneshot(submit("u1", "hello")).await.unwrap();
    let id = state.store.fetch_unprocessed("u1").unwrap()[0].id;

    let (conn, mut rx) = ConnectionHandle::pair("u1");
    state.registry.register(conn.clone());
    {
        let engine = state.engine.clone();
        tokio::spawn(async move { engine.deliver_all("u1").await });
    }
    rx.recv().await.unwrap();
    state.engine.on_ack("u1", id).unwrap();

    // reconnects never see it again
    for _ in 0..2 {
        state.registry.remove(&conn);
        let (conn2, mut rx2) = ConnectionHandle::pair("u1");
        state.registry.register(conn2.clone());
        state.engine.deliver_all("u1").await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx2.recv())
                .await
                .is_err()
        );
        state.registry.remove(&conn2);
    }
}
