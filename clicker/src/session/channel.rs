// Channel session: one WebSocket connection to /api/<id>/listen
//
// Each session runs on its own tokio task and reports everything it sees as
// ChannelEvents on a single mpsc stream owned by the supervisor:
// - exactly one of Opened / Failed first
// - then zero or more Message(text)
// - then exactly one terminal Closed / Failed
//
// Events are tagged with the session generation so the supervisor can drop
// anything from a session it has already let go of.

use crate::session::config::ChannelSettings;
use crate::session::protocol::ChannelId;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Normal closure, sent when the user stops listening
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away, sent when the daemon shuts down
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Reported when the peer closed without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;

/// How long to wait for the server to acknowledge our close frame
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Monotonic per-supervisor session counter
pub type Generation = u64;

/// Server that hosts channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host, optionally with port (e.g. "clickertrain.ing" or "127.0.0.1:8098")
    pub host: String,
    /// wss/https when true, ws/http otherwise
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
        }
    }

    /// `wss://{host}/api/{id}/listen`
    pub fn listen_url(&self, id: &ChannelId) -> Result<Url, url::ParseError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        self.channel_url(scheme, id, "listen")
    }

    /// `https://{host}/api/{id}/click`
    pub fn click_url(&self, id: &ChannelId) -> Result<Url, url::ParseError> {
        let scheme = if self.secure { "https" } else { "http" };
        self.channel_url(scheme, id, "click")
    }

    fn channel_url(&self, scheme: &str, id: &ChannelId, action: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{}://{}/", scheme, self.host))?;
        // The id is one opaque path segment; the url crate percent-encodes it
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .clear()
            .extend(["api", id.as_str(), action]);
        Ok(url)
    }
}

/// What a channel session observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The server accepted the session
    Opened,
    /// A text frame pushed by the server
    Message(String),
    /// The connection ended with a close handshake
    Closed { code: u16, reason: String },
    /// The connection could not be made, or dropped without a close handshake
    Failed(String),
}

/// A ChannelEvent tagged with the session it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEnvelope {
    pub generation: Generation,
    pub channel_id: ChannelId,
    pub event: ChannelEvent,
}

pub type EventSender = mpsc::UnboundedSender<ChannelEnvelope>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEnvelope>;

/// Graceful shutdown request passed to a session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Owner's handle on one live session. Dropping it without calling
/// [`close`](Self::close) also shuts the session down.
#[derive(Debug)]
pub struct ChannelHandle {
    channel_id: ChannelId,
    generation: Generation,
    close_tx: Option<oneshot::Sender<CloseRequest>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    /// Create a handle and the receiving end the session task listens on
    pub fn new(
        channel_id: ChannelId,
        generation: Generation,
    ) -> (Self, oneshot::Receiver<CloseRequest>) {
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                channel_id,
                generation,
                close_tx: Some(close_tx),
                task: None,
            },
            close_rx,
        )
    }

    fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Ask the session to close with `code`. Returns immediately; the session
    /// answers with a Closed event once the server acknowledges. Returns
    /// false when the session had already ended.
    pub fn close(mut self, code: u16, reason: impl Into<String>) -> bool {
        let request = CloseRequest {
            code,
            reason: reason.into(),
        };
        match self.close_tx.take() {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        }
    }

    /// Wait for the session task to finish (it always does after a close)
    pub async fn join(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(CloseRequest {
                code: CLOSE_GOING_AWAY,
                reason: "shutting down".to_string(),
            });
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Opens channel sessions. Implementations must return without waiting for
/// the network and report the outcome on `events`.
pub trait Connector: Send + Sync {
    fn open(&self, channel_id: &ChannelId, generation: Generation, events: EventSender)
        -> ChannelHandle;
}

/// tokio-tungstenite backed connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Endpoint,
    settings: ChannelSettings,
}

impl WsConnector {
    pub fn new(endpoint: Endpoint, settings: ChannelSettings) -> Self {
        Self { endpoint, settings }
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        channel_id: &ChannelId,
        generation: Generation,
        events: EventSender,
    ) -> ChannelHandle {
        let (handle, close_rx) = ChannelHandle::new(channel_id.clone(), generation);
        let reporter = Reporter {
            generation,
            channel_id: channel_id.clone(),
            events,
        };

        let url = match self.endpoint.listen_url(channel_id) {
            Ok(url) => url,
            Err(e) => {
                reporter.send(ChannelEvent::Failed(format!("invalid listen url: {}", e)));
                return handle;
            }
        };

        let settings = self.settings;
        let task = tokio::spawn(async move {
            run_session(url, settings, reporter, close_rx).await;
        });
        handle.with_task(task)
    }
}

struct Reporter {
    generation: Generation,
    channel_id: ChannelId,
    events: EventSender,
}

impl Reporter {
    fn send(&self, event: ChannelEvent) {
        // Supervisor gone means nobody cares any more
        let _ = self.events.send(ChannelEnvelope {
            generation: self.generation,
            channel_id: self.channel_id.clone(),
            event,
        });
    }
}

async fn run_session(
    url: Url,
    settings: ChannelSettings,
    reporter: Reporter,
    mut close_rx: oneshot::Receiver<CloseRequest>,
) {
    tracing::debug!(generation = reporter.generation, %url, "connecting");

    let connect = async {
        match settings.connect_timeout {
            Some(limit) => match timeout(limit, connect_async(url.as_str())).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("connect timed out after {:?}", limit)),
            },
            None => connect_async(url.as_str()).await.map_err(|e| e.to_string()),
        }
    };

    let ws = tokio::select! {
        result = connect => match result {
            Ok((ws, _response)) => ws,
            Err(reason) => {
                reporter.send(ChannelEvent::Failed(reason));
                return;
            }
        },
        request = &mut close_rx => {
            // Closed before the server ever answered
            let request = request.unwrap_or_else(|_| dropped_handle());
            reporter.send(ChannelEvent::Closed { code: request.code, reason: request.reason });
            return;
        }
    };

    reporter.send(ChannelEvent::Opened);

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            request = &mut close_rx => {
                let request = request.unwrap_or_else(|_| dropped_handle());
                let frame = CloseFrame {
                    code: CloseCode::from(request.code),
                    reason: request.reason.clone().into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(error = %e, "close frame not delivered");
                }
                // Drain until the server echoes the close or the link drops
                let _ = timeout(CLOSE_ACK_TIMEOUT, async {
                    while let Some(Ok(msg)) = stream.next().await {
                        if matches!(msg, Message::Close(_)) {
                            break;
                        }
                    }
                })
                .await;
                reporter.send(ChannelEvent::Closed { code: request.code, reason: request.reason });
                return;
            }
            frame = next_frame(&mut stream, settings.idle_timeout) => match frame {
                Some(Some(Ok(Message::Text(text)))) => {
                    reporter.send(ChannelEvent::Message(text));
                }
                Some(Some(Ok(Message::Close(frame)))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                    reporter.send(ChannelEvent::Closed { code, reason });
                    return;
                }
                // Pings are answered by tungstenite; binary frames carry nothing for us
                Some(Some(Ok(_))) => {}
                Some(Some(Err(e))) => {
                    reporter.send(ChannelEvent::Failed(e.to_string()));
                    return;
                }
                Some(None) => {
                    reporter.send(ChannelEvent::Failed("connection dropped".to_string()));
                    return;
                }
                None => {
                    let limit = settings.idle_timeout.unwrap_or_default();
                    reporter.send(ChannelEvent::Failed(format!(
                        "no frames for {}s",
                        limit.as_secs()
                    )));
                    return;
                }
            }
        }
    }
}

/// None when the idle timeout elapsed first
async fn next_frame<S>(stream: &mut S, idle_timeout: Option<Duration>) -> Option<Option<S::Item>>
where
    S: futures_util::Stream + Unpin,
{
    match idle_timeout {
        Some(limit) => timeout(limit, stream.next()).await.ok(),
        None => Some(stream.next().await),
    }
}

fn dropped_handle() -> CloseRequest {
    CloseRequest {
        code: CLOSE_GOING_AWAY,
        reason: "handle dropped".to_string(),
    }
}
