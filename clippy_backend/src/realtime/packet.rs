//! Text framing for Engine.IO v4 / Socket.IO v5 over a raw WebSocket.
//!
//! Engine packets: `0` open, `1` close, `2` ping, `3` pong, `4` message,
//! `6` noop. A `4` message carries a Socket.IO packet:
//! `<type>[/<nsp>,][<ack id>][<json array>]`.

use serde_json::Value;

use crate::error::RealtimeError;

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Value),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
        ack_id: Option<u64>,
    },
    Ack {
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

pub fn parse_engine(text: &str) -> Result<EnginePacket, RealtimeError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| RealtimeError::Codec("empty frame".to_string()))?;
    let rest = chars.as_str();

    match kind {
        '0' => serde_json::from_str(rest)
            .map(EnginePacket::Open)
            .map_err(|e| RealtimeError::Codec(format!("bad open payload: {}", e))),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(rest.to_string())),
        '3' => Ok(EnginePacket::Pong(rest.to_string())),
        '4' => Ok(EnginePacket::Message(rest.to_string())),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(RealtimeError::Codec(format!(
            "unknown engine packet type '{}'",
            other
        ))),
    }
}

pub fn parse_socket(text: &str) -> Result<SocketPacket, RealtimeError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| RealtimeError::Codec("empty socket packet".to_string()))?;
    let mut rest = chars.as_str();

    // Only the default namespace is used; skip an explicit one if present.
    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        };
    }

    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    let ack_id = if digits > 0 {
        Some(
            rest[..digits]
                .parse::<u64>()
                .map_err(|e| RealtimeError::Codec(format!("bad ack id: {}", e)))?,
        )
    } else {
        None
    };
    let body = &rest[digits..];

    let parse_body = || -> Result<Value, RealtimeError> {
        serde_json::from_str(body)
            .map_err(|e| RealtimeError::Codec(format!("bad packet body: {}", e)))
    };

    match kind {
        '0' => {
            if body.is_empty() {
                Ok(SocketPacket::Connect(None))
            } else {
                Ok(SocketPacket::Connect(Some(parse_body()?)))
            }
        }
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let mut args = match parse_body()? {
                Value::Array(items) => items,
                other => {
                    return Err(RealtimeError::Codec(format!(
                        "event payload is not an array: {}",
                        other
                    )))
                }
            };
            if args.is_empty() {
                return Err(RealtimeError::Codec("event without a name".to_string()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(RealtimeError::Codec(format!(
                        "event name is not a string: {}",
                        other
                    )))
                }
            };
            Ok(SocketPacket::Event { name, args, ack_id })
        }
        '3' => {
            let ack_id =
                ack_id.ok_or_else(|| RealtimeError::Codec("ack without an id".to_string()))?;
            let args = match parse_body()? {
                Value::Array(items) => items,
                other => vec![other],
            };
            Ok(SocketPacket::Ack { ack_id, args })
        }
        '4' => Ok(SocketPacket::ConnectError(
            parse_body().unwrap_or(Value::Null),
        )),
        other => Err(RealtimeError::Codec(format!(
            "unsupported socket packet type '{}'",
            other
        ))),
    }
}

/// `42[<id>]["name", payload]`
pub fn encode_event(name: &str, payload: &Value, ack_id: Option<u64>) -> String {
    let body = Value::Array(vec![Value::String(name.to_string()), payload.clone()]);
    match ack_id {
        Some(id) => format!("42{}{}", id, body),
        None => format!("42{}", body),
    }
}

pub fn encode_connect() -> String {
    "40".to_string()
}

pub fn encode_pong(data: &str) -> String {
    format!("3{}", data)
}
