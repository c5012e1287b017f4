//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Only the text packets used by the instrument are supported. Binary
//! attachments are recognized so they can be skipped, never decoded.
//!
//! ```text
//! engine frame  = <type digit> <data>         0 open, 1 close, 2 ping, 3 pong, 4 message
//! socket packet = <type digit> [<n>-] [<nsp>,] [<ack id>] [<json>]
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, VaonisError};

const DEFAULT_NAMESPACE: &str = "/";

/// Parameters announced by the server in the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or_else(|| malformed("empty engine frame"))?;
        let data = chars.as_str();

        match kind {
            '0' => serde_json::from_str(data)
                .map(EnginePacket::Open)
                .map_err(|e| malformed(&format!("bad open packet: {}", e))),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(data.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(malformed(&format!("unknown engine packet type '{}'", other))),
        }
    }

    /// Client-side encoding. Open packets are server-only and encode as noop.
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(_) | EnginePacket::Noop => "6".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Upgrade => "5".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        id: Option<u64>,
        data: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        data: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
    /// Binary event or ack; attachments arrive as separate frames.
    Binary {
        attachments: usize,
    },
}

impl SocketPacket {
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Event `name` with positional `args` on the default namespace.
    pub fn event(name: &str, args: Vec<Value>, id: Option<u64>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(name.to_string()));
        data.extend(args);
        SocketPacket::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id,
            data,
        }
    }

    pub fn ack(id: u64, data: Vec<Value>) -> Self {
        SocketPacket::Ack {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id,
            data,
        }
    }

    /// Event name and arguments, for event packets.
    pub fn event_parts(&self) -> Option<(&str, &[Value])> {
        match self {
            SocketPacket::Event { data, .. } => {
                let (name, args) = data.split_first()?;
                Some((name.as_str()?, args))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SocketPacket::Connect { namespace, data } => {
                format!("0{}{}", namespace_part(namespace, data.is_some()), opt_json(data))
            }
            SocketPacket::Disconnect { namespace } => format!("1{}", namespace_part(namespace, false)),
            SocketPacket::Event { namespace, id, data } => format!(
                "2{}{}{}",
                namespace_part(namespace, true),
                id.map(|i| i.to_string()).unwrap_or_default(),
                Value::Array(data.clone())
            ),
            SocketPacket::Ack { namespace, id, data } => format!(
                "3{}{}{}",
                namespace_part(namespace, true),
                id,
                Value::Array(data.clone())
            ),
            SocketPacket::ConnectError { namespace, data } => {
                format!("4{}{}", namespace_part(namespace, data.is_some()), opt_json(data))
            }
            SocketPacket::Binary { attachments } => format!("5{}-[]", attachments),
        }
    }

    pub fn decode(packet: &str) -> Result<Self> {
        let mut chars = packet.chars();
        let kind = chars.next().ok_or_else(|| malformed("empty socket packet"))?;
        let mut rest = chars.as_str();

        if kind == '5' || kind == '6' {
            let (count, _) = rest
                .split_once('-')
                .ok_or_else(|| malformed("binary packet without attachment count"))?;
            let attachments = count
                .parse()
                .map_err(|_| malformed("bad attachment count"))?;
            return Ok(SocketPacket::Binary { attachments });
        }

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            match rest.split_once(',') {
                Some((nsp, tail)) => {
                    namespace = nsp.to_string();
                    rest = tail;
                }
                None => {
                    namespace = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|_| malformed("bad ack id"))?,
            )
        } else {
            None
        };
        let body = &rest[digits..];
        let json: Option<Value> = if body.is_empty() {
            None
        } else {
            Some(serde_json::from_str(body).map_err(|e| malformed(&format!("bad packet json: {}", e)))?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data: json }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => Ok(SocketPacket::Event {
                namespace,
                id,
                data: into_array(json)?,
            }),
            '3' => Ok(SocketPacket::Ack {
                namespace,
                id: id.ok_or_else(|| malformed("ack without id"))?,
                data: into_array(json)?,
            }),
            '4' => Ok(SocketPacket::ConnectError { namespace, data: json }),
            other => Err(malformed(&format!("unknown socket packet type '{}'", other))),
        }
    }

    /// Wraps the packet in an Engine.IO message frame.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn namespace_part(namespace: &str, followed: bool) -> String {
    if namespace == DEFAULT_NAMESPACE {
        String::new()
    } else if followed {
        format!("{},", namespace)
    } else {
        namespace.to_string()
    }
}

fn opt_json(data: &Option<Value>) -> String {
    data.as_ref().map(Value::to_string).unwrap_or_default()
}

fn into_array(json: Option<Value>) -> Result<Vec<Value>> {
    match json {
        Some(Value::Array(items)) => Ok(items),
        None => Ok(Vec::new()),
        Some(_) => Err(malformed("event payload must be an array")),
    }
}

fn malformed(reason: &str) -> VaonisError {
    VaonisError::Channel(format!("malformed packet: {}", reason))
}
