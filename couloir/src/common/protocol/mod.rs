// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Control messages exchanged between the relay and exposing hosts
//!
//! Messages share their byte stream with raw HTTP traffic, so each one is a single
//! line of the form `<KEY> <json-payload>` terminated by `\r\n\r\n`. Anything that
//! does not start with a known key prefix is left untouched for the HTTP layer.

mod message;
mod stream;

pub use message::{
  decode_message, Decoded, ErrorResponse, JoinRequest, Message, MessageKey, OpenRequest,
  OpenResponse, MAX_MESSAGE_LENGTH, MESSAGE_PREFIX, MESSAGE_SEPARATOR,
};
pub use stream::{AckPolicy, ProtocolStream};

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
  #[error("Malformed couloir message: {0}")]
  Malformed(String),
  #[error("Couloir message exceeded {max} bytes without a terminator")]
  MessageTooLarge { max: usize },
  #[error(
    "Unexpected response from the relay. Check that you are connecting to a couloir relay running a compatible version"
  )]
  Mismatch,
  #[error("Expected {expected} but received {received}")]
  UnexpectedMessage {
    expected: MessageKey,
    received: MessageKey,
  },
  #[error("Connection closed prematurely")]
  ClosedPrematurely,
  /// The peer answered with an `{"error": ...}` payload
  #[error("{0}")]
  Remote(String),
  #[error("Invalid couloir message payload: {0}")]
  Payload(#[from] serde_json::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}
