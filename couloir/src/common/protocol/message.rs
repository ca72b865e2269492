// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::fmt::{self, Display};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;
use crate::util::find_bytes;

pub const MESSAGE_SEPARATOR: &[u8] = b"\r\n\r\n";
pub const MESSAGE_PREFIX: &[u8] = b"COULOIR_";
pub const MAX_MESSAGE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
  Open,
  OpenAck,
  Join,
  JoinAck,
  Stream,
  StreamAck,
}

impl MessageKey {
  pub const fn as_str(self) -> &'static str {
    match self {
      MessageKey::Open => "COULOIR_OPEN",
      MessageKey::OpenAck => "COULOIR_OPEN_ACK",
      MessageKey::Join => "COULOIR_JOIN",
      MessageKey::JoinAck => "COULOIR_JOIN_ACK",
      MessageKey::Stream => "COULOIR_STREAM",
      MessageKey::StreamAck => "COULOIR_STREAM_ACK",
    }
  }

  /// The acknowledgement expected in answer to this key, if it is a request
  pub const fn ack(self) -> Option<Self> {
    match self {
      MessageKey::Open => Some(MessageKey::OpenAck),
      MessageKey::Join => Some(MessageKey::JoinAck),
      MessageKey::Stream => Some(MessageKey::StreamAck),
      _ => None,
    }
  }

  pub const fn is_ack(self) -> bool {
    self.ack().is_none()
  }

  pub fn parse(raw: &str) -> Option<Self> {
    Some(match raw {
      "COULOIR_OPEN" => MessageKey::Open,
      "COULOIR_OPEN_ACK" => MessageKey::OpenAck,
      "COULOIR_JOIN" => MessageKey::Join,
      "COULOIR_JOIN_ACK" => MessageKey::JoinAck,
      "COULOIR_STREAM" => MessageKey::Stream,
      "COULOIR_STREAM_ACK" => MessageKey::StreamAck,
      _ => return None,
    })
  }
}

impl Display for MessageKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
  pub key: MessageKey,
  pub payload: Option<Value>,
}

impl Message {
  pub fn new(key: MessageKey, payload: Option<Value>) -> Self {
    Self { key, payload }
  }

  pub fn encode(&self) -> Vec<u8> {
    let payload = self
      .payload
      .as_ref()
      .map(Value::to_string)
      .unwrap_or_else(|| String::from("null"));
    let mut encoded =
      Vec::with_capacity(self.key.as_str().len() + 1 + payload.len() + MESSAGE_SEPARATOR.len());
    encoded.extend_from_slice(self.key.as_str().as_bytes());
    encoded.push(b' ');
    encoded.extend_from_slice(payload.as_bytes());
    encoded.extend_from_slice(MESSAGE_SEPARATOR);
    encoded
  }

  /// The `error` field of the payload, present when the peer rejected a request
  pub fn error(&self) -> Option<&str> {
    self.payload.as_ref()?.get("error")?.as_str()
  }

  pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
    let payload = self.payload.clone().unwrap_or(Value::Null);
    Ok(serde_json::from_value(payload)?)
  }
}

/// Outcome of inspecting the head of a byte buffer for a control message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
  /// A full message, occupying the first `consumed` bytes of the buffer
  Message { message: Message, consumed: usize },
  /// The buffer is a prefix of a message; more bytes are required
  Incomplete,
  /// The buffer does not start with a control message
  Passthrough,
}

pub fn decode_message(buffer: &[u8]) -> Result<Decoded, ProtocolError> {
  if buffer.is_empty() {
    return Ok(Decoded::Incomplete);
  }
  let compared = buffer.len().min(MESSAGE_PREFIX.len());
  if buffer[..compared] != MESSAGE_PREFIX[..compared] {
    return Ok(Decoded::Passthrough);
  }
  let end = match find_bytes(buffer, MESSAGE_SEPARATOR) {
    Some(end) => end,
    None if buffer.len() > MAX_MESSAGE_LENGTH => {
      return Err(ProtocolError::MessageTooLarge {
        max: MAX_MESSAGE_LENGTH,
      })
    }
    None => return Ok(Decoded::Incomplete),
  };
  let line = std::str::from_utf8(&buffer[..end])
    .map_err(|_| ProtocolError::Malformed(String::from("message is not valid UTF-8")))?;
  let (key, payload) = match line.split_once(' ') {
    Some((key, payload)) => (key, payload.trim()),
    None => (line, ""),
  };
  let key = MessageKey::parse(key)
    .ok_or_else(|| ProtocolError::Malformed(format!("unknown message key {:?}", key)))?;
  let payload = if payload.is_empty() {
    None
  } else {
    match serde_json::from_str::<Value>(payload) {
      Ok(Value::Null) => None,
      Ok(value) => Some(value),
      Err(error) => {
        return Err(ProtocolError::Malformed(format!(
          "invalid JSON payload for {}: {}",
          key, error
        )))
      }
    }
  };
  Ok(Decoded::Message {
    message: Message { key, payload },
    consumed: end + MESSAGE_SEPARATOR.len(),
  })
}

/// Sent by a host on its control connection to reserve a public host name
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
  pub version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub couloir_label: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cli_token: Option<String>,
}

impl fmt::Debug for OpenRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OpenRequest")
      .field("version", &self.version)
      .field("couloir_label", &self.couloir_label)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("cli_token", &self.cli_token.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenResponse {
  pub key: String,
  pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
  pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
    }
  }

  pub fn to_value(&self) -> Value {
    serde_json::json!({ "error": self.error })
  }
}
