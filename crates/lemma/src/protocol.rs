//! Protocol message types
//!
//! Typed view over [`Envelope`]. Each header has a fixed field layout:
//!
//! | header          | fields                                                        |
//! |-----------------|---------------------------------------------------------------|
//! | `marco`         | guest, room, dialect, version                                 |
//! | `polo`          | room, tcp port                                                |
//! | `register`      | guest, local port, hears[], speaks[], dialect, version, opts  |
//! | `heartbeat`     | guest                                                         |
//! | `heartbeat_ack` | (none)                                                        |
//! | `event`         | sender, event name, event value                               |

use std::borrow::Cow;
use std::fmt;

use serde_json::{json, Value};

use crate::envelope::Envelope;
use crate::error::{Error, Result};

pub const MARCO: &str = "marco";
pub const POLO: &str = "polo";
pub const REGISTER: &str = "register";
pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const EVENT: &str = "event";

/// Value carried by an `event` message
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Arrays, objects and null, embedded as-is
    Structured(Value),
}

impl EventValue {
    /// Text form of the value: strings as-is, everything else as JSON
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            EventValue::String(s) => Cow::Borrowed(s),
            EventValue::Bool(b) => Cow::Owned(b.to_string()),
            EventValue::Number(n) => Cow::Owned(n.to_string()),
            EventValue::Structured(v) => Cow::Owned(v.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            EventValue::Bool(b) => Value::Bool(*b),
            EventValue::Number(n) => Value::Number(n.clone()),
            EventValue::String(s) => Value::String(s.clone()),
            EventValue::Structured(v) => v.clone(),
        }
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<Value> for EventValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Bool(b) => EventValue::Bool(b),
            Value::Number(n) => EventValue::Number(n),
            Value::String(s) => EventValue::String(s),
            other => EventValue::Structured(other),
        }
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        EventValue::Bool(v)
    }
}

impl From<&str> for EventValue {
    fn from(v: &str) -> Self {
        EventValue::String(v.to_string())
    }
}

impl From<String> for EventValue {
    fn from(v: String) -> Self {
        EventValue::String(v)
    }
}

impl From<&EventValue> for EventValue {
    fn from(v: &EventValue) -> Self {
        v.clone()
    }
}

macro_rules! integer_event_value {
    ($($t:ty),*) => {
        $(impl From<$t> for EventValue {
            fn from(v: $t) -> Self {
                EventValue::Number(v.into())
            }
        })*
    };
}

integer_event_value!(i32, i64, u32, u64);

impl From<f64> for EventValue {
    fn from(v: f64) -> Self {
        // NaN and infinities have no JSON number form
        match serde_json::Number::from_f64(v) {
            Some(n) => EventValue::Number(n),
            None => EventValue::String(v.to_string()),
        }
    }
}

impl From<f32> for EventValue {
    fn from(v: f32) -> Self {
        EventValue::from(f64::from(v))
    }
}

/// Options object sent with registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Heartbeat interval in seconds
    pub heartbeat: u64,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Availability announcement, broadcast by the guest
    Marco {
        guest_name: String,
        room_name: String,
        dialect: String,
        version: String,
    },

    /// Host reply to an announcement
    Polo { room_name: String, tcp_port: u16 },

    /// First message on a new messaging session
    Register {
        guest_name: String,
        local_port: u16,
        hears: Vec<String>,
        speaks: Vec<String>,
        dialect: String,
        version: String,
        options: RegisterOptions,
    },

    /// Guest liveness probe
    Heartbeat { guest_name: String },

    /// Host acknowledgement of a heartbeat
    HeartbeatAck,

    /// User event, either direction
    Event {
        sender_name: String,
        event_name: String,
        value: EventValue,
    },
}

impl Message {
    pub fn header(&self) -> &'static str {
        match self {
            Message::Marco { .. } => MARCO,
            Message::Polo { .. } => POLO,
            Message::Register { .. } => REGISTER,
            Message::Heartbeat { .. } => HEARTBEAT,
            Message::HeartbeatAck => HEARTBEAT_ACK,
            Message::Event { .. } => EVENT,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let env = Envelope::new(self.header());
        match self {
            Message::Marco {
                guest_name,
                room_name,
                dialect,
                version,
            } => env
                .push(guest_name.as_str())
                .push(room_name.as_str())
                .push(dialect.as_str())
                .push(version.as_str()),
            Message::Polo {
                room_name,
                tcp_port,
            } => env.push(room_name.as_str()).push(*tcp_port),
            Message::Register {
                guest_name,
                local_port,
                hears,
                speaks,
                dialect,
                version,
                options,
            } => env
                .push(guest_name.as_str())
                .push(*local_port)
                .push(hears.clone())
                .push(speaks.clone())
                .push(dialect.as_str())
                .push(version.as_str())
                .push(json!({ "heartbeat": options.heartbeat })),
            Message::Heartbeat { guest_name } => env.push(guest_name.as_str()),
            Message::HeartbeatAck => env,
            Message::Event {
                sender_name,
                event_name,
                value,
            } => env
                .push(sender_name.as_str())
                .push(event_name.as_str())
                .push(value.to_json()),
        }
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        match env.header() {
            MARCO => {
                env.require(5)?;
                Ok(Message::Marco {
                    guest_name: env.str_field(1)?.to_string(),
                    room_name: env.str_field(2)?.to_string(),
                    dialect: env.str_field(3)?.to_string(),
                    version: env.str_field(4)?.to_string(),
                })
            }
            POLO => {
                env.require(3)?;
                Ok(Message::Polo {
                    room_name: env.str_field(1)?.to_string(),
                    tcp_port: port_field(env, 2)?,
                })
            }
            REGISTER => {
                env.require(8)?;
                let heartbeat = env
                    .field(7)
                    .and_then(|opts| opts.get("heartbeat"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        Error::MalformedPayload("register options lack heartbeat".into())
                    })?;
                Ok(Message::Register {
                    guest_name: env.str_field(1)?.to_string(),
                    local_port: port_field(env, 2)?,
                    hears: string_list(env, 3)?,
                    speaks: string_list(env, 4)?,
                    dialect: env.str_field(5)?.to_string(),
                    version: env.str_field(6)?.to_string(),
                    options: RegisterOptions { heartbeat },
                })
            }
            HEARTBEAT => {
                env.require(2)?;
                Ok(Message::Heartbeat {
                    guest_name: env.str_field(1)?.to_string(),
                })
            }
            HEARTBEAT_ACK => Ok(Message::HeartbeatAck),
            EVENT => {
                env.require(4)?;
                let value = env.field(3).cloned().unwrap_or(Value::Null);
                Ok(Message::Event {
                    sender_name: env.str_field(1)?.to_string(),
                    event_name: env.str_field(2)?.to_string(),
                    value: EventValue::from(value),
                })
            }
            other => Err(Error::UnknownHeader(other.to_string())),
        }
    }

    /// Serialize to bare envelope bytes
    pub fn encode(&self) -> Vec<u8> {
        self.to_envelope().encode()
    }

    /// Parse bare envelope bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_envelope(&Envelope::decode(bytes)?)
    }
}

/// Ports arrive as numbers (possibly `7733.0`), or as numeric strings from
/// some hosts
fn port_field(env: &Envelope, index: usize) -> Result<u16> {
    let port = match env.field(index) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(f))
                    .map(|f| f as u64)
            })
            .and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    port.ok_or_else(|| {
        Error::MalformedPayload(format!("{} field {} is not a port", env.header(), index))
    })
}

fn string_list(env: &Envelope, index: usize) -> Result<Vec<String>> {
    env.field(index)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| {
            Error::MalformedPayload(format!("{} field {} is not a list", env.header(), index))
        })
}
