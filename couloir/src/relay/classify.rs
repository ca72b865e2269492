// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use crate::common::http::{HttpMessageHead, HEAD_SEPARATOR, MAX_HEADERS, MAX_HEAD_LENGTH};
use crate::common::protocol::{decode_message, Decoded};

const MAX_METHOD_LENGTH: usize = 16;

/// What the first bytes of a relay socket say about its peer
#[derive(Debug, Clone, PartialEq)]
pub enum Sniff {
  /// Not enough bytes to decide yet
  Incomplete,
  /// A couloir control message from an exposing host
  Control,
  /// An HTTP client, with its first request head
  Client(HttpMessageHead),
  Invalid(String),
}

/// Classifies a socket from the bytes received so far, without consuming them
pub fn classify(buffer: &[u8]) -> Sniff {
  match decode_message(buffer) {
    Ok(Decoded::Message { .. }) => Sniff::Control,
    Ok(Decoded::Incomplete) => Sniff::Incomplete,
    Ok(Decoded::Passthrough) => classify_http(buffer),
    Err(error) => Sniff::Invalid(error.to_string()),
  }
}

fn classify_http(buffer: &[u8]) -> Sniff {
  if buffer.first() == Some(&0x16) {
    return Sniff::Invalid(String::from("TLS handshake received on a plain HTTP relay"));
  }
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut request = httparse::Request::new(&mut headers);
  let parsed = request.parse(buffer);
  if let Some(method) = request.method {
    if method.len() > MAX_METHOD_LENGTH || !method.bytes().all(|byte| byte.is_ascii_uppercase()) {
      return Sniff::Invalid(String::from("Not an HTTP request"));
    }
  }
  match parsed {
    Ok(httparse::Status::Complete(length)) if !buffer[..length].ends_with(HEAD_SEPARATOR) => {
      Sniff::Invalid(String::from("Request head must use CRLF line endings"))
    }
    Ok(httparse::Status::Complete(length)) => {
      match HttpMessageHead::parse(&buffer[..length - HEAD_SEPARATOR.len()]) {
        Ok(head) => Sniff::Client(head),
        Err(error) => Sniff::Invalid(error.to_string()),
      }
    }
    Ok(httparse::Status::Partial) if buffer.len() > MAX_HEAD_LENGTH => {
      Sniff::Invalid(String::from("Request head too large"))
    }
    Ok(httparse::Status::Partial) if request.method.is_none() && buffer.len() > MAX_METHOD_LENGTH => {
      Sniff::Invalid(String::from("Not an HTTP request"))
    }
    Ok(httparse::Status::Partial) => Sniff::Incomplete,
    Err(error) => Sniff::Invalid(format!("Not an HTTP request: {}", error)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn control_messages() {
    assert_eq!(classify(b"COULOIR_JOIN {\"key\":\"k\"}\r\n\r\n"), Sniff::Control);
    assert_eq!(classify(b"COULOIR_JO"), Sniff::Incomplete);
    assert!(matches!(
      classify(b"COULOIR_NOPE {}\r\n\r\n"),
      Sniff::Invalid(_)
    ));
  }

  #[test]
  fn http_clients() {
    assert_eq!(classify(b"GE"), Sniff::Incomplete);
    assert_eq!(classify(b"GET /index.html HTTP/1.1\r\nHost: a"), Sniff::Incomplete);
    match classify(b"GET / HTTP/1.1\r\nHost: demo.test.local\r\n\r\nbody") {
      Sniff::Client(head) => assert_eq!(head.host(), Some("demo.test.local")),
      other => panic!("Expected a client, got {:?}", other),
    }
  }

  #[test]
  fn garbage_is_rejected_early() {
    assert!(matches!(classify(&[0x16, 0x03, 0x01, 0x02]), Sniff::Invalid(_)));
    assert!(matches!(classify(b"hello there"), Sniff::Invalid(_)));
    assert!(matches!(classify(b"GET / SPDY/3\r\n\r\n"), Sniff::Invalid(_)));
    assert!(matches!(
      classify(b"GET / HTTP/1.1\r\nbad header\r\n\r\n"),
      Sniff::Invalid(_)
    ));
    assert!(matches!(
      classify(b"HTTP/1.1 200 OK\r\n\r\n"),
      Sniff::Invalid(_)
    ));
  }
}
