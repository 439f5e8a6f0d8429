//! Integration tests: supervisor + real WebSocket sessions against a local
//! channel server.
//!
//! Run with: cargo test --test listener_session

mod helpers;

use clicker_lib::session::channel::{Endpoint, WsConnector};
use clicker_lib::session::config::ChannelSettings;
use clicker_lib::session::error::SessionError;
use clicker_lib::session::lifecycle::{LifecycleEvent, LifecycleSubscription};
use clicker_lib::session::notify::AudioCue;
use clicker_lib::session::persistence::{FileStore, ListenState};
use clicker_lib::session::protocol::{ChannelId, SessionState};
use clicker_lib::session::supervisor::{Supervisor, SupervisorHandle};
use clicker_lib::session::trigger::TriggerClient;
use clicker_lib::test_utils::{assert_eventually, assert_eventually_bool};
use helpers::channel_server::{ChannelServer, MISSING_CHANNEL};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct CountingCue {
    plays: AtomicUsize,
}

impl CountingCue {
    fn count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

impl AudioCue for CountingCue {
    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    handle: SupervisorHandle,
    events: LifecycleSubscription,
    store: Arc<FileStore>,
    cue: Arc<CountingCue>,
    _state_dir: TempDir,
}

fn spawn_supervisor(server: &ChannelServer, settings: ChannelSettings) -> Fixture {
    spawn_supervisor_with(server, settings, TempDir::new().unwrap())
}

fn spawn_supervisor_with(
    server: &ChannelServer,
    settings: ChannelSettings,
    state_dir: TempDir,
) -> Fixture {
    let store = Arc::new(FileStore::new(state_dir.path().join("listen_state.json")));
    let cue = Arc::new(CountingCue::default());
    let connector = Arc::new(WsConnector::new(server.endpoint(), settings));
    let supervisor = Supervisor::new(store.clone(), connector, cue.clone());
    let events = supervisor.subscribe();
    let (handle, _task) = supervisor.spawn();
    Fixture {
        handle,
        events,
        store,
        cue,
        _state_dir: state_dir,
    }
}

async fn next_event(events: &mut LifecycleSubscription) -> LifecycleEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("no lifecycle event in time")
        .expect("lifecycle bus closed")
}

async fn wait_for_listener(server: &ChannelServer, channel: &str) {
    let channel = channel.to_string();
    assert_eventually_bool("server to accept listener", EVENT_TIMEOUT, POLL, || {
        let seen = server.listeners().contains(&channel);
        async move { seen }
    })
    .await;
}

fn id(s: &str) -> ChannelId {
    ChannelId::new(s).unwrap()
}

fn started(channel: &str) -> LifecycleEvent {
    LifecycleEvent::Started {
        channel_id: channel.to_string(),
    }
}

#[tokio::test]
async fn test_click_sentinel_plays_cue() {
    let server = ChannelServer::start().await;
    let mut fx = spawn_supervisor(&server, ChannelSettings::default());

    fx.handle.start(id("abc")).await.unwrap();
    assert_eq!(next_event(&mut fx.events).await, started("abc"));
    assert_eq!(
        ListenState::load(fx.store.as_ref()).unwrap(),
        ListenState::new(true, "abc")
    );
    wait_for_listener(&server, "abc").await;

    server.push("c");
    let cue = fx.cue.clone();
    assert_eventually_bool("first cue", EVENT_TIMEOUT, POLL, || {
        let played = cue.count() == 1;
        async move { played }
    })
    .await;

    // Only the sentinel makes a sound
    server.push("h");
    server.push("x");
    server.push("c");
    let cue = fx.cue.clone();
    assert_eventually_bool("second cue", EVENT_TIMEOUT, POLL, || {
        let played = cue.count() >= 2;
        async move { played }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.cue.count(), 2);

    let status = fx.handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Active);
}

#[tokio::test]
async fn test_stop_sends_normal_close() {
    let server = ChannelServer::start().await;
    let mut fx = spawn_supervisor(&server, ChannelSettings::default());

    fx.handle.start(id("abc")).await.unwrap();
    assert_eq!(next_event(&mut fx.events).await, started("abc"));
    wait_for_listener(&server, "abc").await;

    let status = fx.handle.stop().await.unwrap();
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(next_event(&mut fx.events).await, LifecycleEvent::Stopped);
    assert_eq!(
        ListenState::load(fx.store.as_ref()).unwrap(),
        ListenState::new(false, "abc")
    );

    let closes = assert_eventually("server to see the close", EVENT_TIMEOUT, POLL, || {
        let closes = server.closes();
        async move {
            if closes.is_empty() {
                Err("no close yet")
            } else {
                Ok(closes)
            }
        }
    })
    .await;
    assert_eq!(closes, vec![("abc".to_string(), 1000)]);
}

#[tokio::test]
async fn test_server_close_goes_idle_without_retry() {
    let server = ChannelServer::start().await;
    let mut fx = spawn_supervisor(&server, ChannelSettings::default());

    fx.handle.start(id("abc")).await.unwrap();
    assert_eq!(next_event(&mut fx.events).await, started("abc"));
    wait_for_listener(&server, "abc").await;

    server.close_all(4000);
    assert_eq!(next_event(&mut fx.events).await, LifecycleEvent::Stopped);

    let status = fx.handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Idle);
    assert!(!status.desired_connected);
    assert_eq!(status.channel_id, "abc");
    let last_error = status.last_error.expect("abnormal close not reported");
    assert!(last_error.contains("4000"), "{}", last_error);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.listeners().len(), 1, "supervisor reconnected on its own");
}

#[tokio::test]
async fn test_switching_channels_closes_previous_listener() {
    let server = ChannelServer::start().await;
    let mut fx = spawn_supervisor(&server, ChannelSettings::default());

    fx.handle.start(id("abc")).await.unwrap();
    assert_eq!(next_event(&mut fx.events).await, started("abc"));
    wait_for_listener(&server, "abc").await;

    fx.handle.start(id("xyz")).await.unwrap();
    assert_eq!(next_event(&mut fx.events).await, started("xyz"));

    let closes = assert_eventually("old listener to close", EVENT_TIMEOUT, POLL, || {
        let closes = server.closes();
        async move {
            if closes.is_empty() {
                Err("no close yet")
            } else {
                Ok(closes)
            }
        }
    })
    .await;
    assert_eq!(closes, vec![("abc".to_string(), 1000)]);

    let status = fx.handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Active);
    assert_eq!(status.live_channel.as_deref(), Some("xyz"));
    assert_eq!(
        ListenState::load(fx.store.as_ref()).unwrap(),
        ListenState::new(true, "xyz")
    );
}

#[tokio::test]
async fn test_restart_resumes_persisted_channel() {
    let server = ChannelServer::start().await;
    let state_dir = TempDir::new().unwrap();
    ListenState::new(true, "abc")
        .save(&FileStore::new(state_dir.path().join("listen_state.json")))
        .unwrap();

    let mut fx = spawn_supervisor_with(&server, ChannelSettings::default(), state_dir);
    fx.handle.on_restart().await.unwrap();

    assert_eq!(next_event(&mut fx.events).await, started("abc"));
    wait_for_listener(&server, "abc").await;
    assert_eq!(server.listeners(), vec!["abc".to_string()]);
}

#[tokio::test]
async fn test_unreachable_server_reports_connect_failure() {
    let server = ChannelServer::start().await;
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(store_dir.path().join("listen_state.json")));
    let connector = Arc::new(WsConnector::new(
        Endpoint::new(format!("127.0.0.1:{}", port), false),
        ChannelSettings::default(),
    ));
    let supervisor = Supervisor::new(store.clone(), connector, Arc::new(CountingCue::default()));
    let mut events = supervisor.subscribe();
    let (handle, _task) = supervisor.spawn();

    handle.start(id("abc")).await.unwrap();
    assert_eq!(next_event(&mut events).await, LifecycleEvent::Stopped);

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Idle);
    let last_error = status.last_error.unwrap();
    assert!(last_error.contains("failed to connect"), "{}", last_error);
    assert_eq!(
        ListenState::load(store.as_ref()).unwrap(),
        ListenState::new(false, "abc")
    );
    assert!(server.listeners().is_empty());
}

#[tokio::test]
async fn test_silent_server_trips_idle_timeout() {
    let server = ChannelServer::start().await;
    let settings = ChannelSettings {
        connect_timeout: Some(Duration::from_secs(5)),
        idle_timeout: Some(Duration::from_millis(300)),
    };
    let mut fx = spawn_supervisor(&server, settings);

    fx.handle.start(id("abc")).await.unwrap();
    assert_eq!(next_event(&mut fx.events).await, started("abc"));
    assert_eq!(next_event(&mut fx.events).await, LifecycleEvent::Stopped);

    let last_error = fx.handle.status().await.unwrap().last_error.unwrap();
    assert!(last_error.contains("no frames"), "{}", last_error);
}

#[tokio::test]
async fn test_click_trigger_success() {
    let server = ChannelServer::start().await;
    let client = TriggerClient::new(server.endpoint());

    client.send(&id("abc")).await.unwrap();

    assert_eq!(server.clicks(), vec!["abc".to_string()]);
}

#[tokio::test]
async fn test_click_trigger_not_found_is_failure() {
    let server = ChannelServer::start().await;
    let client = TriggerClient::new(server.endpoint());

    let err = client.send(&id(MISSING_CHANNEL)).await.unwrap_err();

    match err {
        SessionError::TriggerFailure { channel_id, reason } => {
            assert_eq!(channel_id, MISSING_CHANNEL);
            assert!(reason.contains("404"), "{}", reason);
        }
        other => panic!("expected TriggerFailure, got {:?}", other),
    }
    assert!(server.clicks().is_empty());
}
