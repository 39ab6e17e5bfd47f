//! End-to-end session tests against a loopback WebSocket music server

use bytes::Bytes;
use futures_util::SinkExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use aux_listener::audio::playback::{ClockedOutput, RenderHost};
use aux_listener::config::{ServerConfig, SessionConfig};
use aux_listener::error::{Error, SessionError};
use aux_listener::protocol::{encode_pcm, ControlSignal, SessionEvent};
use aux_listener::session::{Session, SessionRegistry, SessionState};

/// 0.1 s of stereo 48 kHz: 9600 sample ring, primes at 4800
const PRIMING_SAMPLES: usize = 4800;

/// Serve one scripted connection per receiver, in accept order. A connection
/// is closed by the server once its script sender is dropped.
async fn spawn_server(scripts: Vec<mpsc::UnboundedReceiver<Message>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        for mut script in scripts {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            tokio::spawn(async move {
                while let Some(message) = script.recv().await {
                    if ws.send(message).await.is_err() {
                        return;
                    }
                }
                let _ = ws.close(None).await;
            });
        }
    });

    port
}

/// Serve one scripted connection, then accept TCP without ever completing
/// the WebSocket handshake so a reconnect hangs until its timeout.
async fn spawn_stalling_server(mut script: mpsc::UnboundedReceiver<Message>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        while let Some(message) = script.recv().await {
            if ws.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws.close(None).await;

        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    port
}

fn session(port: u16, ready_timeout_secs: u64) -> Session {
    let session = SessionConfig {
        buffered_seconds: 0.1,
        ready_timeout_secs,
        stats_interval_secs: 1,
        ..Default::default()
    };
    let server = ServerConfig {
        base_url: format!("ws://127.0.0.1:{}", port),
        connect_timeout_ms: 2000,
    };
    Session::new(session, server)
}

fn host() -> Box<dyn RenderHost> {
    Box::new(ClockedOutput::new(2, 128, Duration::from_millis(1)))
}

fn pcm(samples: usize) -> Message {
    Message::Binary(Bytes::from(encode_pcm(&vec![0.1; samples])))
}

fn control(signal: ControlSignal) -> Message {
    Message::Binary(Bytes::from(vec![signal.as_byte()]))
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_lifecycle() {
    let (script, rx) = mpsc::unbounded_channel();
    script.send(pcm(PRIMING_SAMPLES)).unwrap();
    let port = spawn_server(vec![rx]).await;

    let registry = Arc::new(SessionRegistry::new());
    let mut session = session(port, 5).with_registry(registry.clone());
    let mut events = session.subscribe();
    let init = session.init_request("lobby", "alice");

    session.start(init, host()).await.unwrap();
    assert_eq!(session.state(), SessionState::Listening);
    assert_eq!(next_event(&mut events).await, SessionEvent::WsWorkerReady);

    let stats = session.stats().unwrap();
    assert_eq!(stats.room_id, "lobby");
    assert_eq!(stats.ring.capacity, 2 * PRIMING_SAMPLES);
    assert!(registry.get(&session.id()).is_some());

    // Song boundary: the render side drains and acknowledges
    script.send(control(ControlSignal::SongFinished)).unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::SongFinished);

    script.send(control(ControlSignal::SongStarting)).unwrap();
    match next_event(&mut events).await {
        SessionEvent::SongStarting { seconds_remaining } => {
            assert!((seconds_remaining - 0.05).abs() < 1e-9)
        }
        other => panic!("unexpected event {:?}", other),
    }

    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(registry.get(&session.id()).is_none());

    assert!(matches!(
        session.stop().await,
        Err(Error::Session(SessionError::AlreadyStopped))
    ));
    assert!(matches!(
        session.stats(),
        Err(Error::Session(SessionError::AlreadyStopped))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_before_ready_fails_start() {
    let (script, rx) = mpsc::unbounded_channel();
    script.send(pcm(100)).unwrap();
    drop(script);
    let port = spawn_server(vec![rx]).await;

    let mut session = session(port, 5);
    let init = session.init_request("lobby", "alice");

    let err = session.start(init, host()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::ConnectionClosedBeforeReady(_))
    ));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ready_timeout() {
    let (_hold, rx) = mpsc::unbounded_channel::<Message>();
    let port = spawn_server(vec![rx]).await;

    let mut session = session(port, 1);
    let init = session.init_request("lobby", "alice");

    let err = session.start(init, host()).await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::ReadyTimeout(1))));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_once_after_loss() {
    let (first, first_rx) = mpsc::unbounded_channel();
    first.send(pcm(PRIMING_SAMPLES)).unwrap();
    drop(first);

    let (second, second_rx) = mpsc::unbounded_channel();
    second.send(pcm(PRIMING_SAMPLES)).unwrap();

    let port = spawn_server(vec![first_rx, second_rx]).await;
    let mut session = session(port, 5);
    let mut events = session.subscribe();
    let init = session.init_request("lobby", "alice");

    session.start(init, host()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::WsWorkerReady);
    assert_eq!(next_event(&mut events).await, SessionEvent::Reconnected);
    assert_eq!(session.state(), SessionState::Listening);

    // Losing the second connection is final
    drop(second);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionLost { .. }
    ));

    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_pending_reconnect() {
    let (script, rx) = mpsc::unbounded_channel();
    script.send(pcm(PRIMING_SAMPLES)).unwrap();
    drop(script);
    let port = spawn_stalling_server(rx).await;

    let config = SessionConfig {
        buffered_seconds: 0.1,
        ready_timeout_secs: 5,
        ..Default::default()
    };
    let server = ServerConfig {
        base_url: format!("ws://127.0.0.1:{}", port),
        connect_timeout_ms: 5000,
    };
    let mut session = Session::new(config, server);
    let mut events = session.subscribe();
    let init = session.init_request("lobby", "alice");

    session.start(init, host()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::WsWorkerReady);

    // The first connection has closed and the reconnect is stuck in the handshake
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), session.stop())
        .await
        .expect("stop waited out the reconnect")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Stopped);
}
