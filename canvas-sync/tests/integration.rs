//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full open / edit / save / notify pipeline.

use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

use canvas_sync::client::{ClientEvent, ConnectionState, SyncClient};
use canvas_sync::{
    ChangeNotification, DocumentBackend, DocumentId, EditSession, Identity, NewDocument,
    SessionConfig, SessionEvent, SessionId, SharedBackend, SyncError, SyncServer, SyncStatus,
};

/// Start an in-memory server on a free port, return it with its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

async fn connected_client(url: &str) -> Arc<SyncClient> {
    let client = Arc::new(SyncClient::new(url));
    client.connect().await.unwrap();
    client
}

fn fast_config() -> SessionConfig {
    SessionConfig::with_debounce(Duration::from_millis(50))
}

async fn open_session(client: &Arc<SyncClient>, name: &str, doc: DocumentId) -> EditSession {
    let backend: SharedBackend = client.clone();
    let identity = Identity::with_session(name, format!("user-{name}"), name);
    EditSession::open(backend, identity, doc, fast_config())
        .await
        .unwrap()
}

/// Poll `check` until it holds, failing the test after five seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_pings() {
    let (server, url) = start_test_server().await;
    let client = SyncClient::new(&url);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(events.recv().await, Some(ClientEvent::Connected));

    client.send_ping().await.unwrap();
    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert!(stats.total_messages >= 1);
}

#[tokio::test]
async fn test_create_open_save_round_trip() {
    let (server, url) = start_test_server().await;
    let client = connected_client(&url).await;

    let created = client
        .create(NewDocument::new("u1", "Ada").with_title("Sketch"))
        .await
        .unwrap();
    assert_eq!(created.title, "Sketch");
    assert_eq!(created.content, "");

    let opened = client.open(created.id).await.unwrap();
    assert_eq!(opened, created);

    let saved = client
        .save(
            created.id,
            "Sketch".into(),
            "<circle r=\"4\"/>".into(),
            &SessionId::new("s1"),
        )
        .await
        .unwrap();
    assert_eq!(saved.content, "<circle r=\"4\"/>");
    assert!(saved.updated_at >= created.updated_at);

    let stored = server.coordinator().open(created.id).await.unwrap();
    assert_eq!(stored, saved);
}

#[tokio::test]
async fn test_server_errors_reach_client() {
    let (_server, url) = start_test_server().await;
    let client = connected_client(&url).await;
    let missing = DocumentId::new();

    assert_eq!(
        client.open(missing).await.unwrap_err(),
        SyncError::NotFound(missing)
    );
    assert_eq!(
        client
            .save(missing, "T".into(), "C".into(), &SessionId::new("s1"))
            .await
            .unwrap_err(),
        SyncError::NotFound(missing)
    );
    assert!(matches!(
        client.create(NewDocument::new("u1", "")).await,
        Err(SyncError::InvalidDocument(_))
    ));
}

#[tokio::test]
async fn test_edit_reaches_session_on_other_client() {
    let (server, url) = start_test_server().await;
    let alice_client = connected_client(&url).await;
    let bob_client = connected_client(&url).await;

    let doc = alice_client
        .create(NewDocument::new("alice", "Alice"))
        .await
        .unwrap();
    let alice = open_session(&alice_client, "alice", doc.id).await;
    let mut bob = open_session(&bob_client, "bob", doc.id).await;
    let mut bob_events = bob.take_event_rx().unwrap();

    alice.on_local_edit("Shared board", "alice was here").await;

    eventually("bob to see alice's save", || async {
        bob.snapshot().await.content == "alice was here"
    })
    .await;
    let snapshot = bob.snapshot().await;
    assert_eq!(snapshot.title, "Shared board");
    assert_eq!(snapshot.last_remote_origin, Some(SessionId::new("alice")));
    assert_eq!(
        bob_events.recv().await,
        Some(SessionEvent::RemoteApplied {
            origin: SessionId::new("alice")
        })
    );

    // Alice's own change came back to her and was ignored
    eventually("alice to settle", || async {
        alice.status().await == SyncStatus::Clean
    })
    .await;
    assert_eq!(alice.snapshot().await.last_remote_origin, None);
    eventually("both connections to get the change", || async {
        server.stats().await.forwarded_changes >= 2
    })
    .await;

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_last_save_wins_across_clients() {
    let (server, url) = start_test_server().await;
    let a_client = connected_client(&url).await;
    let b_client = connected_client(&url).await;

    let doc = a_client
        .create(NewDocument::new("u1", "Ada"))
        .await
        .unwrap();
    let a = open_session(&a_client, "a", doc.id).await;
    let b = open_session(&b_client, "b", doc.id).await;

    a.on_local_edit("Board", "from a").await;
    a.flush().await.unwrap();
    b.on_local_edit("Board", "from b").await;
    b.flush().await.unwrap();

    assert_eq!(
        server.coordinator().open(doc.id).await.unwrap().content,
        "from b"
    );
    eventually("a to converge", || async {
        a.snapshot().await.content == "from b"
    })
    .await;
}

#[tokio::test]
async fn test_close_flushes_and_releases_subscription() {
    let (server, url) = start_test_server().await;
    let client = connected_client(&url).await;
    let doc = client.create(NewDocument::new("u1", "Ada")).await.unwrap();
    let topic = ChangeNotification::topic(doc.id);

    let session = EditSession::open(
        client.clone(),
        Identity::with_session("s1", "u1", "Ada"),
        doc.id,
        SessionConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(server.coordinator().channel().subscriber_count(&topic).await, 1);

    // Default debounce is long; close must not wait for it
    session.on_local_edit("Board", "saved on close").await;
    session.close().await.unwrap();
    assert_eq!(
        server.coordinator().open(doc.id).await.unwrap().content,
        "saved on close"
    );

    eventually("server to release the topic", || async {
        server.coordinator().channel().topic_count().await == 0
    })
    .await;
}

#[tokio::test]
async fn test_sessions_on_one_client_share_server_subscription() {
    let (server, url) = start_test_server().await;
    let client = connected_client(&url).await;
    let doc = client.create(NewDocument::new("u1", "Ada")).await.unwrap();
    let topic = ChangeNotification::topic(doc.id);

    let first = open_session(&client, "first", doc.id).await;
    let second = open_session(&client, "second", doc.id).await;
    assert_eq!(server.coordinator().channel().subscriber_count(&topic).await, 1);

    first.on_local_edit("Board", "from first").await;
    eventually("second to see first's save", || async {
        second.snapshot().await.content == "from first"
    })
    .await;

    first.close().await.unwrap();
    // Second session still listens through the same connection
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.coordinator().channel().topic_count().await, 1);

    second.close().await.unwrap();
    eventually("server to release the topic", || async {
        server.coordinator().channel().topic_count().await == 0
    })
    .await;
}

#[tokio::test]
async fn test_disconnect_ends_sessions_and_fails_saves() {
    let (server, url) = start_test_server().await;
    let client = connected_client(&url).await;
    let mut client_events = client.take_event_rx().unwrap();
    let doc = client.create(NewDocument::new("u1", "Ada")).await.unwrap();

    let mut session = open_session(&client, "s1", doc.id).await;
    let mut session_events = session.take_event_rx().unwrap();

    client.disconnect().await;
    eventually("client to notice the disconnect", || async {
        client.connection_state().await == ConnectionState::Disconnected
    })
    .await;
    assert_eq!(client_events.recv().await, Some(ClientEvent::Connected));
    assert_eq!(client_events.recv().await, Some(ClientEvent::Disconnected));
    assert_eq!(
        session_events.recv().await,
        Some(SessionEvent::SubscriptionLost)
    );

    session.on_local_edit("Board", "offline").await;
    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, SyncError::PersistFailure(_)));
    assert_eq!(session.status().await, SyncStatus::Dirty);

    eventually("server to drop the connection", || async {
        server.stats().await.active_connections == 0
    })
    .await;
    assert_eq!(server.coordinator().channel().topic_count().await, 0);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (server, url) = start_test_server().await;
    let client = connected_client(&url).await;
    let mut client_events = client.take_event_rx().unwrap();
    let doc = client.create(NewDocument::new("u1", "Ada")).await.unwrap();
    let before = open_session(&client, "before", doc.id).await;

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    // The old connection winding down must leave the new one alone
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client_events.recv().await, Some(ClientEvent::Connected));
    assert_eq!(client_events.recv().await, Some(ClientEvent::Disconnected));
    assert_eq!(client_events.recv().await, Some(ClientEvent::Connected));
    assert!(client_events.try_recv().is_err());

    client.send_ping().await.unwrap();
    assert_eq!(client.open(doc.id).await.unwrap().id, doc.id);
    before.close().await.unwrap();

    let after = open_session(&client, "after", doc.id).await;
    let other = connected_client(&url).await;
    other
        .save(
            doc.id,
            "Board".into(),
            "after reconnect".into(),
            &SessionId::new("other"),
        )
        .await
        .unwrap();
    eventually("the new session to see the save", || async {
        after.snapshot().await.content == "after reconnect"
    })
    .await;
    eventually("server to drop the old connection", || async {
        server.stats().await.active_connections == 2
    })
    .await;
    after.close().await.unwrap();
}
