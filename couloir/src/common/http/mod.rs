// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Just enough HTTP/1.x to route and rewrite message heads in flight
//!
//! Bodies are never parsed: once a head has been handled, bytes flow through
//! untouched until the opposite direction signals a new exchange.

mod head;
mod response;
mod transform;

pub use head::{
  strip_port, HttpMessageHead, RequestLine, HEAD_SEPARATOR, MAX_HEADERS, MAX_HEAD_LENGTH,
};
pub use response::{
  banner, html_response, STATUS_BAD_GATEWAY, STATUS_BAD_REQUEST, STATUS_NOT_FOUND, STATUS_OK,
};
pub use transform::{Direction, HeadHook, HttpHeadTransform};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
  #[error("Invalid HTTP head: {0}")]
  InvalidHead(String),
  #[error("HTTP head exceeded {max} bytes")]
  HeadTooLarge { max: usize },
  /// The peer answered with something that is not HTTP, typically TLS
  #[error("Response is not HTTP")]
  InvalidProtocol,
  #[error("{0}")]
  Hook(String),
}
