//! Local stand-in for the channel server: a WebSocket listen endpoint and an
//! HTTP click endpoint on 127.0.0.1.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clicker_lib::session::channel::Endpoint;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Clicking this channel answers 404
pub const MISSING_CHANNEL: &str = "missing";

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Close(u16),
}

#[derive(Debug, Default)]
struct Recorded {
    listeners: Vec<String>,
    closes: Vec<(String, u16)>,
    clicks: Vec<String>,
}

#[derive(Clone)]
pub struct ChannelServer {
    addr: SocketAddr,
    pushes: broadcast::Sender<Push>,
    recorded: Arc<Mutex<Recorded>>,
}

impl ChannelServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (pushes, _) = broadcast::channel(16);
        let server = Self {
            addr,
            pushes,
            recorded: Arc::default(),
        };

        let app = Router::new()
            .route("/api/:id/listen", get(listen))
            .route("/api/:id/click", get(click))
            .with_state(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        server
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host(), false)
    }

    /// Send a text frame to every connected listener
    pub fn push(&self, text: &str) {
        let _ = self.pushes.send(Push::Text(text.to_string()));
    }

    /// Close every connected listener with `code`
    pub fn close_all(&self, code: u16) {
        let _ = self.pushes.send(Push::Close(code));
    }

    /// Channel ids of every listen connection accepted so far
    pub fn listeners(&self) -> Vec<String> {
        self.recorded.lock().unwrap().listeners.clone()
    }

    /// Close codes sent by clients, per channel
    pub fn closes(&self) -> Vec<(String, u16)> {
        self.recorded.lock().unwrap().closes.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.recorded.lock().unwrap().clicks.clone()
    }
}

async fn listen(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(server): State<ChannelServer>,
) -> Response {
    ws.on_upgrade(move |socket| serve_listener(socket, id, server))
}

async fn serve_listener(mut socket: WebSocket, id: String, server: ChannelServer) {
    // Subscribe before recording so a push issued after listeners() shows the id is seen
    let mut pushes = server.pushes.subscribe();
    server.recorded.lock().unwrap().listeners.push(id.clone());

    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(Push::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Close(code)) => {
                    let frame = CloseFrame {
                        code,
                        reason: "server closing".into(),
                    };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break;
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| f.code).unwrap_or(1005);
                    server.recorded.lock().unwrap().closes.push((id.clone(), code));
                    break;
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

async fn click(Path(id): Path<String>, State(server): State<ChannelServer>) -> StatusCode {
    if id == MISSING_CHANNEL {
        return StatusCode::NOT_FOUND;
    }
    server.recorded.lock().unwrap().clicks.push(id);
    StatusCode::OK
}
