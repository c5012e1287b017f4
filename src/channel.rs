//! Live command channel (Socket.IO over websocket).
//!
//! The instrument pushes status over a persistent Socket.IO connection and
//! accepts control commands on it. Commands travel as one positional array
//! under the fixed `message` event: `[name]` or `[name, payload]`.
//!
//! One background task owns the websocket. It answers heartbeats, runs
//! registered handlers in arrival order, and pairs acknowledgements with
//! waiting callers through a correlation id.
//!
//! # Example
//!
//! ```no_run
//! use vaonis_link::channel::{ChannelConfig, CommandChannel};
//!
//! # async fn run() -> vaonis_link::Result<()> {
//! let channel = CommandChannel::builder(ChannelConfig::new("my-phone"))
//!     .on_status_updated(|status| println!("status: {}", status))
//!     .connect()
//!     .await?;
//!
//! channel.take_control(None)?;
//! let ack = channel.get_status().await?;
//! if let Some(err) = ack.error() {
//!     eprintln!("instrument refused: {}", err);
//! }
//! channel.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::error::{Result, VaonisError};
use crate::packet::{EnginePacket, OpenHandshake, SocketPacket};
use crate::payload::format_value;

/// Event every command is emitted under.
pub const COMMAND_EVENT: &str = "message";
pub const STATUS_UPDATED: &str = "STATUS_UPDATED";
pub const CONTROL_ERROR: &str = "CONTROL_ERROR";
/// Dispatched locally once the namespace handshake completes.
pub const CONNECT_EVENT: &str = "connect";
/// Dispatched locally when the connection ends for any reason.
pub const DISCONNECT_EVENT: &str = "disconnect";

pub type EventHandler = Box<dyn FnMut(&Value) + Send + 'static>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `http://host:port` of the socket server.
    pub url: String,
    pub path: String,
    pub device_id: String,
    pub name: Option<String>,
    pub country_code: Option<String>,
    pub debug: bool,
    /// Bounds the handshake and each acknowledged command.
    pub ack_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::from(&SocketConfig {
            device_id: device_id.into(),
            ..SocketConfig::default()
        })
    }

    /// `ws://host:port/socket.io/?EIO=4&transport=websocket&id=...`
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url).map_err(|_| VaonisError::InvalidUrl(self.url.clone()))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| VaonisError::InvalidUrl(self.url.clone()))?;
        url.set_path(&format!("{}/", self.path.trim_end_matches('/')));

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("EIO", "4");
            query.append_pair("transport", "websocket");
            query.append_pair("id", &self.device_id);
            if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
                query.append_pair("name", name);
            }
            if let Some(code) = self.country_code.as_deref().filter(|c| !c.is_empty()) {
                query.append_pair("countryCode", code);
            }
            if self.debug {
                query.append_pair("debug", "true");
            }
        }
        Ok(url)
    }
}

impl From<&SocketConfig> for ChannelConfig {
    fn from(config: &SocketConfig) -> Self {
        Self {
            url: config.url.clone(),
            path: config.path.clone(),
            device_id: config.device_id.clone(),
            name: config.name.clone(),
            country_code: config.country_code.clone(),
            debug: config.debug,
            ack_timeout: Duration::from_secs(config.ack_timeout_secs),
        }
    }
}

/// Remote reply to an acknowledged command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    /// Correlation id the command was sent with.
    pub id: u64,
    pub args: Vec<Value>,
}

impl CommandAck {
    pub fn value(&self) -> Option<&Value> {
        self.args.first()
    }

    /// Error reported by the instrument, in either of its two shapes: a
    /// wrapper object with a non-null `error` field, or a bare error value
    /// (err-first `[err, data]`, or an object with `message` plus `code`/`name`).
    pub fn error(&self) -> Option<&Value> {
        let first = self.args.first()?;
        if let Some(err) = first.get("error").filter(|e| !e.is_null()) {
            return Some(err);
        }
        if self.args.len() >= 2 && !first.is_null() {
            return Some(first);
        }
        let bare = first.get("message").is_some_and(Value::is_string)
            && (first.get("code").is_some() || first.get("name").is_some());
        bare.then_some(first)
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

/// Positional command array: `[name]` or `[name, payload]`.
pub fn encode_command(name: &str, payload: Option<Value>) -> Value {
    match payload {
        Some(payload) => json!([name, payload]),
        None => json!([name]),
    }
}

pub struct CommandChannelBuilder {
    config: ChannelConfig,
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl CommandChannelBuilder {
    /// Registers `handler` for push event `event`. Several handlers per
    /// event run in registration order.
    pub fn on<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.handlers.entry(event.into()).or_default().push(Box::new(handler));
        self
    }

    pub fn on_status_updated<F>(self, handler: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.on(STATUS_UPDATED, handler)
    }

    pub fn on_control_error<F>(self, handler: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.on(CONTROL_ERROR, handler)
    }

    pub fn on_connect<F>(self, handler: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.on(CONNECT_EVENT, handler)
    }

    pub fn on_disconnect<F>(self, handler: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.on(DISCONNECT_EVENT, handler)
    }

    /// Opens the websocket and completes the Socket.IO handshake.
    pub async fn connect(self) -> Result<CommandChannel> {
        let url = self.config.websocket_url()?;
        info!(url = %url, "SOCKET connect");

        let (ws, _response) = tokio::time::timeout(self.config.ack_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| VaonisError::Timeout)?
            .map_err(|e| VaonisError::Channel(e.to_string()))?;

        CommandChannel::start(ws, self.config, self.handlers).await
    }
}

enum Outbound {
    Emit {
        frame: String,
        ack: Option<(u64, oneshot::Sender<Vec<Value>>)>,
    },
    Abandon(u64),
}

/// Removes the correlation entry unless the ack arrived, including when the
/// waiting future is dropped.
struct AckGuard<'a> {
    outbound: &'a mpsc::UnboundedSender<Outbound>,
    id: u64,
    settled: bool,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.outbound.send(Outbound::Abandon(self.id));
        }
    }
}

/// Handle to a live command channel.
pub struct CommandChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    next_ack_id: AtomicU64,
    config: ChannelConfig,
    cancel: CancellationToken,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

impl CommandChannel {
    pub fn builder(config: ChannelConfig) -> CommandChannelBuilder {
        CommandChannelBuilder {
            config,
            handlers: HashMap::new(),
        }
    }

    async fn start<S>(
        mut ws: S,
        config: ChannelConfig,
        handlers: HashMap<String, Vec<EventHandler>>,
    ) -> Result<Self>
    where
        S: Stream<Item = std::result::Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
    {
        let open = tokio::time::timeout(config.ack_timeout, handshake(&mut ws))
            .await
            .map_err(|_| VaonisError::Timeout)??;
        info!(sid = %open.sid, ping_interval = open.ping_interval, "SOCKET connected");

        let (outbound, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();
        let event_loop = EventLoop {
            ws,
            commands,
            pending: HashMap::new(),
            handlers,
            cancel: cancel.clone(),
            closed: closed.clone(),
            heartbeat: Duration::from_millis(open.ping_interval + open.ping_timeout),
        };

        Ok(Self {
            outbound,
            next_ack_id: AtomicU64::new(0),
            config,
            cancel,
            closed,
            task: tokio::spawn(event_loop.run()),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// True once the event loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queues a command without waiting for any reply. Names outside the
    /// known command set are sent unchanged.
    pub fn send_command(&self, name: &str, payload: Option<Value>) -> Result<()> {
        let command = encode_command(name, payload);
        info!(command = %command, "SOCKET send");
        let frame = SocketPacket::event(COMMAND_EVENT, vec![command], None).to_frame();
        self.outbound
            .send(Outbound::Emit { frame, ack: None })
            .map_err(|_| VaonisError::ChannelClosed)
    }

    /// Sends a command and waits for its acknowledgement using the
    /// configured timeout.
    pub async fn request(&self, name: &str, payload: Option<Value>) -> Result<CommandAck> {
        self.request_with_timeout(name, payload, self.config.ack_timeout).await
    }

    /// Dropping the returned future abandons the wait; a late ack is discarded.
    pub async fn request_with_timeout(
        &self,
        name: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<CommandAck> {
        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let command = encode_command(name, payload);
        info!(id, command = %command, "SOCKET send with ack");

        let frame = SocketPacket::event(COMMAND_EVENT, vec![command], Some(id)).to_frame();
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Emit {
                frame,
                ack: Some((id, tx)),
            })
            .map_err(|_| VaonisError::ChannelClosed)?;

        let mut waiting = AckGuard {
            outbound: &self.outbound,
            id,
            settled: false,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(args)) => {
                waiting.settled = true;
                Ok(CommandAck { id, args })
            }
            Ok(Err(_)) => Err(VaonisError::ChannelClosed),
            Err(_) => Err(VaonisError::AckTimeout { id }),
        }
    }

    pub fn take_control(&self, user_id: Option<&str>) -> Result<()> {
        self.send_command(
            "takeControl",
            user_id.filter(|id| !id.is_empty()).map(|id| json!({ "userId": id })),
        )
    }

    pub fn release_control(&self, user_id: Option<&str>) -> Result<()> {
        self.send_command(
            "releaseControl",
            user_id.filter(|id| !id.is_empty()).map(|id| json!({ "userId": id })),
        )
    }

    /// Sends the epoch time in milliseconds, bare or as `{timestamp}`.
    pub fn set_system_time(&self, epoch_ms: i64, as_object: bool) -> Result<()> {
        let payload = if as_object {
            json!({ "timestamp": epoch_ms })
        } else {
            json!(epoch_ms)
        };
        self.send_command("setSystemTime", Some(payload))
    }

    pub fn set_user_name(&self, user: Option<&str>) -> Result<()> {
        let payload = json!({
            "device": self.config.device_id,
            "user": user.unwrap_or("null"),
        });
        self.send_command("setUserName", Some(payload))
    }

    pub fn send_user_name(&self, user_id: &str, user: &str) -> Result<()> {
        self.send_command("sendUserName", Some(json!({ "userId": user_id, "user": user })))
    }

    pub async fn get_status(&self) -> Result<CommandAck> {
        self.request("getStatus", None).await
    }

    pub async fn restart_app(&self) -> Result<CommandAck> {
        self.request("restartApp", None).await
    }

    pub async fn shutdown(&self) -> Result<CommandAck> {
        self.request("shutdown", None).await
    }

    /// Closes the connection and waits for the event loop to finish.
    pub async fn disconnect(mut self) -> Result<()> {
        info!("SOCKET disconnect");
        self.cancel.cancel();
        (&mut self.task)
            .await
            .map_err(|e| VaonisError::Channel(format!("event loop failed: {}", e)))
    }

    /// Resolves once the event loop has ended, e.g. after the server hangs up.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn next_text<S>(ws: &mut S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => return Err(VaonisError::ChannelClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(VaonisError::Channel(e.to_string())),
        }
    }
}

/// Waits for the Engine.IO open packet, joins the default namespace and
/// waits for the server to confirm.
async fn handshake<S>(ws: &mut S) -> Result<OpenHandshake>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let mut open = None;
    loop {
        let frame = next_text(ws).await?;
        match EnginePacket::decode(&frame)? {
            EnginePacket::Open(handshake) => {
                debug!(sid = %handshake.sid, "Engine.IO open");
                open = Some(handshake);
                send_frame(ws, SocketPacket::connect().to_frame()).await?;
            }
            EnginePacket::Ping => send_frame(ws, EnginePacket::Pong.encode()).await?,
            EnginePacket::Message(data) => match SocketPacket::decode(&data)? {
                SocketPacket::Connect { .. } => {
                    if let Some(open) = open.take() {
                        return Ok(open);
                    }
                }
                SocketPacket::ConnectError { data, .. } => {
                    return Err(VaonisError::Channel(format!(
                        "connection refused: {}",
                        data.unwrap_or(Value::Null)
                    )));
                }
                other => debug!(?other, "Ignoring packet before namespace connect"),
            },
            EnginePacket::Close => return Err(VaonisError::ChannelClosed),
            _ => {}
        }
    }
}

async fn send_frame<S>(ws: &mut S, frame: String) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    ws.send(Message::Text(frame))
        .await
        .map_err(|e| VaonisError::Channel(e.to_string()))
}

struct EventLoop<S> {
    ws: S,
    commands: mpsc::UnboundedReceiver<Outbound>,
    pending: HashMap<u64, oneshot::Sender<Vec<Value>>>,
    handlers: HashMap<String, Vec<EventHandler>>,
    cancel: CancellationToken,
    closed: CancellationToken,
    heartbeat: Duration,
}

impl<S> EventLoop<S>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn run(mut self) {
        self.dispatch(CONNECT_EVENT, &Value::Null);

        let deadline = sleep(self.heartbeat);
        tokio::pin!(deadline);

        loop {
            // Queued commands flush before a requested shutdown.
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Outbound::Emit { frame, ack }) => {
                        if let Some((id, tx)) = ack {
                            self.pending.insert(id, tx);
                        }
                        if let Err(e) = send_frame(&mut self.ws, frame).await {
                            warn!(error = %e, "SOCKET send failed");
                            break;
                        }
                    }
                    Some(Outbound::Abandon(id)) => {
                        self.pending.remove(&id);
                    }
                    None => break,
                },
                _ = self.cancel.cancelled() => {
                    let _ = send_frame(&mut self.ws, SocketPacket::Disconnect { namespace: "/".into() }.to_frame()).await;
                    let _ = self.ws.close().await;
                    break;
                }
                frame = self.ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if matches!(EnginePacket::decode(&text), Ok(EnginePacket::Ping)) {
                            deadline.as_mut().reset(Instant::now() + self.heartbeat);
                        }
                        if self.handle_frame(&text).await.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "SOCKET read failed");
                        break;
                    }
                },
                _ = &mut deadline => {
                    warn!(timeout_ms = self.heartbeat.as_millis() as u64, "SOCKET heartbeat timed out");
                    break;
                }
            }
        }

        // Later sends fail fast; dropping the senders wakes every waiting
        // caller with ChannelClosed.
        self.commands.close();
        self.pending.clear();
        self.closed.cancel();
        info!("SOCKET closed");
        self.dispatch(DISCONNECT_EVENT, &Value::Null);
    }

    async fn handle_frame(&mut self, text: &str) -> ControlFlow<()> {
        let packet = match EnginePacket::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return ControlFlow::Continue(());
            }
        };

        match packet {
            EnginePacket::Ping => {
                if send_frame(&mut self.ws, EnginePacket::Pong.encode()).await.is_err() {
                    return ControlFlow::Break(());
                }
            }
            EnginePacket::Close => return ControlFlow::Break(()),
            EnginePacket::Message(data) => match SocketPacket::decode(&data) {
                Ok(packet) => return self.handle_packet(packet).await,
                Err(e) => warn!(error = %e, "Dropping malformed socket packet"),
            },
            _ => {}
        }
        ControlFlow::Continue(())
    }

    async fn handle_packet(&mut self, packet: SocketPacket) -> ControlFlow<()> {
        match packet {
            SocketPacket::Event { id, data, .. } => {
                let Some((name, args)) = data.split_first() else {
                    return ControlFlow::Continue(());
                };
                let Some(name) = name.as_str() else {
                    return ControlFlow::Continue(());
                };
                let payload = match args {
                    [] => Value::Null,
                    [single] => single.clone(),
                    many => Value::Array(many.to_vec()),
                };
                info!(event = name, payload = %format_value(&payload, 4000), "SOCKET event");
                if !self.dispatch(name, &payload) {
                    debug!(event = name, "No handler registered");
                }
                if let Some(id) = id {
                    let reply = SocketPacket::ack(id, Vec::new()).to_frame();
                    if send_frame(&mut self.ws, reply).await.is_err() {
                        return ControlFlow::Break(());
                    }
                }
            }
            SocketPacket::Ack { id, data, .. } => match self.pending.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(data);
                }
                None => debug!(id, "Ack for unknown or abandoned command"),
            },
            SocketPacket::Disconnect { .. } => return ControlFlow::Break(()),
            SocketPacket::ConnectError { data, .. } => {
                warn!(?data, "SOCKET connect error");
                return ControlFlow::Break(());
            }
            SocketPacket::Binary { attachments } => {
                warn!(attachments, "Skipping binary packet");
            }
            SocketPacket::Connect { .. } => {}
        }
        ControlFlow::Continue(())
    }

    fn dispatch(&mut self, event: &str, payload: &Value) -> bool {
        match self.handlers.get_mut(event) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(payload);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        assert_eq!(encode_command("takeControl", None), json!(["takeControl"]));
        assert_eq!(
            encode_command("setSystemTime", Some(json!({"timestamp": 1234}))),
            json!(["setSystemTime", {"timestamp": 1234}])
        );
    }

    #[test]
    fn test_websocket_url() {
        let config = ChannelConfig {
            name: Some("my-client".into()),
            country_code: Some("US".into()),
            debug: true,
            ..ChannelConfig::new("device-id")
        };
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "ws://10.0.0.1:8083/socket.io/?EIO=4&transport=websocket&id=device-id&name=my-client&countryCode=US&debug=true"
        );

        let minimal = ChannelConfig::new("d");
        assert_eq!(
            minimal.websocket_url().unwrap().as_str(),
            "ws://10.0.0.1:8083/socket.io/?EIO=4&transport=websocket&id=d"
        );
    }

    #[test]
    fn test_ack_error_shapes() {
        let wrapped = CommandAck { id: 1, args: vec![json!({"error": "not in control"})] };
        assert_eq!(wrapped.error(), Some(&json!("not in control")));

        let err_first = CommandAck { id: 2, args: vec![json!("busy"), Value::Null] };
        assert_eq!(err_first.error(), Some(&json!("busy")));

        let bare = CommandAck { id: 3, args: vec![json!({"message": "denied", "code": 403})] };
        assert!(bare.is_error());

        let ok = CommandAck { id: 4, args: vec![json!({"error": null, "result": {"ok": true}})] };
        assert!(!ok.is_error());

        let ok_pair = CommandAck { id: 5, args: vec![Value::Null, json!({"ok": true})] };
        assert!(!ok_pair.is_error());

        let empty = CommandAck { id: 6, args: vec![] };
        assert!(!empty.is_error());
    }

    fn detached_channel() -> (CommandChannel, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let channel = CommandChannel {
            outbound,
            next_ack_id: AtomicU64::new(0),
            config: ChannelConfig::new("d"),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            task: tokio::spawn(async {}),
        };
        (channel, commands)
    }

    #[tokio::test]
    async fn test_dropped_request_abandons_its_id() {
        let (channel, mut commands) = detached_channel();

        let outer = tokio::time::timeout(
            Duration::from_millis(50),
            channel.request_with_timeout("getStatus", None, Duration::from_secs(30)),
        )
        .await;
        assert!(outer.is_err());

        match commands.recv().await {
            Some(Outbound::Emit { ack: Some((id, _)), .. }) => assert_eq!(id, 0),
            _ => panic!("expected the command frame first"),
        }
        assert!(matches!(commands.recv().await, Some(Outbound::Abandon(0))));
    }

    #[tokio::test]
    async fn test_answered_request_leaves_no_abandon() {
        let (channel, mut commands) = detached_channel();

        let answer = async {
            match commands.recv().await {
                Some(Outbound::Emit { ack: Some((_, tx)), .. }) => {
                    let _ = tx.send(vec![json!({"ok": true})]);
                }
                _ => panic!("expected an ack-bearing command"),
            }
        };
        let (ack, ()) = tokio::join!(channel.get_status(), answer);
        assert_eq!(ack.unwrap().args, vec![json!({"ok": true})]);
        assert!(commands.try_recv().is_err());
    }
}
