// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{HttpError, HttpMessageHead, HEAD_SEPARATOR, MAX_HEAD_LENGTH};
use crate::util::find_bytes;

/// Callback applied to every head seen by a transform; it may rewrite headers in place
pub type HeadHook = Box<dyn FnMut(&mut HttpMessageHead) -> Result<(), HttpError> + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
  Request,
  Response,
}

impl Direction {
  const fn index(self) -> usize {
    match self {
      Direction::Request => 0,
      Direction::Response => 1,
    }
  }

  const fn opposite(self) -> Self {
    match self {
      Direction::Request => Direction::Response,
      Direction::Response => Direction::Request,
    }
  }
}

/// State shared by the two transforms watching opposite directions of one connection
#[derive(Debug, Default)]
struct ExchangeLink {
  reset: [AtomicBool; 2],
  upgraded: AtomicBool,
}

impl ExchangeLink {
  fn request_reset(&self, direction: Direction) {
    self.reset[direction.index()].store(true, Ordering::Release);
  }

  fn take_reset(&self, direction: Direction) -> bool {
    self.reset[direction.index()].swap(false, Ordering::AcqRel)
  }

  fn clear_reset(&self, direction: Direction) {
    self.reset[direction.index()].store(false, Ordering::Release);
  }
}

enum State {
  Head(Vec<u8>),
  Passthrough,
}

/// Streaming rewriter for the head of each HTTP message flowing in one direction
///
/// While a head is being received, bytes are held back until the blank line, then the
/// parsed head goes through the hook and is re-emitted. Everything after it passes through
/// untouched until the linked transform of the other direction sees a new head, which is
/// how keep-alive connections get every exchange rewritten. A websocket upgrade turns both
/// directions into permanent passthrough.
pub struct HttpHeadTransform {
  direction: Direction,
  state: State,
  link: Arc<ExchangeLink>,
  hook: Option<HeadHook>,
  heads_seen: u64,
  max_head_length: usize,
}

impl std::fmt::Debug for HttpHeadTransform {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpHeadTransform")
      .field("direction", &self.direction)
      .field("parsing_head", &self.is_parsing_head())
      .field("heads_seen", &self.heads_seen)
      .field("upgraded", &self.is_upgraded())
      .finish()
  }
}

impl HttpHeadTransform {
  pub fn new(direction: Direction) -> Self {
    Self::with_link(direction, Arc::new(ExchangeLink::default()))
  }

  /// Request and response transforms for the two directions of one connection
  pub fn pair() -> (Self, Self) {
    let link = Arc::new(ExchangeLink::default());
    (
      Self::with_link(Direction::Request, link.clone()),
      Self::with_link(Direction::Response, link),
    )
  }

  fn with_link(direction: Direction, link: Arc<ExchangeLink>) -> Self {
    Self {
      direction,
      state: State::Head(Vec::new()),
      link,
      hook: None,
      heads_seen: 0,
      max_head_length: MAX_HEAD_LENGTH,
    }
  }

  pub fn with_hook<F>(mut self, hook: F) -> Self
  where
    F: FnMut(&mut HttpMessageHead) -> Result<(), HttpError> + Send + 'static,
  {
    self.hook = Some(Box::new(hook));
    self
  }

  pub fn with_max_head_length(mut self, max_head_length: usize) -> Self {
    self.max_head_length = max_head_length;
    self
  }

  pub fn direction(&self) -> Direction {
    self.direction
  }

  pub fn heads_seen(&self) -> u64 {
    self.heads_seen
  }

  pub fn is_upgraded(&self) -> bool {
    self.link.upgraded.load(Ordering::Acquire)
  }

  pub fn is_parsing_head(&self) -> bool {
    matches!(self.state, State::Head(_))
  }

  /// Expect a new head on the next chunk, unless the connection was upgraded
  pub fn reset(&mut self) {
    if !self.is_upgraded() {
      self.state = State::Head(Vec::new());
    }
  }

  /// Feeds one chunk, returning the bytes to forward in its place
  pub fn transform<'a>(&mut self, chunk: &'a [u8]) -> Result<Cow<'a, [u8]>, HttpError> {
    if matches!(self.state, State::Passthrough) && self.link.take_reset(self.direction) {
      self.reset();
    }
    let pending = match &mut self.state {
      State::Passthrough => return Ok(Cow::Borrowed(chunk)),
      State::Head(pending) => pending,
    };
    const RESPONSE_PREFIX: &[u8] = b"HTTP/";
    if self.direction == Direction::Response
      && self.heads_seen == 0
      && pending.len() < RESPONSE_PREFIX.len()
    {
      let mut prefix = pending.clone();
      prefix.extend_from_slice(&chunk[..chunk.len().min(RESPONSE_PREFIX.len())]);
      let compared = prefix.len().min(RESPONSE_PREFIX.len());
      if prefix[..compared] != RESPONSE_PREFIX[..compared] {
        return Err(HttpError::InvalidProtocol);
      }
    }
    pending.extend_from_slice(chunk);
    let end = match find_bytes(pending, HEAD_SEPARATOR) {
      Some(end) => end,
      None if pending.len() > self.max_head_length => {
        return Err(HttpError::HeadTooLarge {
          max: self.max_head_length,
        })
      }
      None => return Ok(Cow::Owned(Vec::new())),
    };
    let buffered = std::mem::take(pending);
    let mut head = HttpMessageHead::parse(&buffered[..end])?;
    if let Some(hook) = self.hook.as_mut() {
      hook(&mut head)?;
    }
    self.heads_seen += 1;
    if head.is_websocket_upgrade() {
      tracing::trace!(direction = ?self.direction, "Connection upgraded to websocket");
      self.link.upgraded.store(true, Ordering::Release);
    }
    self.link.clear_reset(self.direction);
    self.link.request_reset(self.direction.opposite());
    self.state = State::Passthrough;

    let mut out = head.to_bytes();
    out.extend_from_slice(&buffered[end + HEAD_SEPARATOR.len()..]);
    Ok(Cow::Owned(out))
  }

  /// Bytes still held back when the stream ended in the middle of a head
  pub fn finish(&mut self) -> Vec<u8> {
    match &mut self.state {
      State::Head(pending) => std::mem::take(pending),
      State::Passthrough => Vec::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn feed(transform: &mut HttpHeadTransform, chunk: &[u8]) -> Vec<u8> {
    transform.transform(chunk).unwrap().into_owned()
  }

  fn close_connection(head: &mut HttpMessageHead) -> Result<(), HttpError> {
    if !head.is_websocket_upgrade() {
      head.set_header("Connection", "close");
    }
    Ok(())
  }

  #[test]
  fn rewrites_heads_split_across_chunks() {
    let mut transform = HttpHeadTransform::new(Direction::Request).with_hook(close_connection);
    assert!(feed(&mut transform, b"GET / HTTP/1.1\r\nHo").is_empty());
    let out = feed(&mut transform, b"st: a.test.local\r\n\r\nbody");
    assert_eq!(
      out,
      b"GET / HTTP/1.1\r\nHost: a.test.local\r\nConnection: close\r\n\r\nbody".to_vec()
    );
    assert_eq!(feed(&mut transform, b"more body"), b"more body".to_vec());
    assert_eq!(transform.heads_seen(), 1);
  }

  #[test]
  fn untouched_heads_are_forwarded_verbatim() {
    let mut transform = HttpHeadTransform::new(Direction::Request);
    let input = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 1\r\n\r\n\x80";
    assert_eq!(feed(&mut transform, input), input.to_vec());
  }

  #[test]
  fn keep_alive_exchanges_are_each_rewritten() {
    let (request, mut response) = HttpHeadTransform::pair();
    let mut request = request.with_hook(close_connection);
    feed(&mut request, b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\n");
    feed(&mut response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    let second = feed(&mut request, b"GET /2 HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(
      second,
      b"GET /2 HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n".to_vec()
    );
    assert_eq!(request.heads_seen(), 2);
  }

  #[test]
  fn websocket_upgrades_stop_interception() {
    let (request, mut response) = HttpHeadTransform::pair();
    let mut request = request.with_hook(close_connection);
    let upgrade = b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
    assert_eq!(feed(&mut request, upgrade), upgrade.to_vec());
    feed(
      &mut response,
      b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    );
    let frame = b"GET / HTTP/1.1\r\nHost: not-a-head\r\n\r\n";
    assert_eq!(feed(&mut request, frame), frame.to_vec());
    assert_eq!(feed(&mut response, frame), frame.to_vec());
    assert!(request.is_upgraded() && response.is_upgraded());
  }

  #[test]
  fn non_http_responses_are_rejected() {
    let mut response = HttpHeadTransform::new(Direction::Response);
    assert_eq!(
      response.transform(&[0x16, 0x03, 0x01]).unwrap_err(),
      HttpError::InvalidProtocol
    );
    let mut split = HttpHeadTransform::new(Direction::Response);
    assert!(split.transform(b"HT").unwrap().is_empty());
    assert!(split.transform(b"TP/1.1 200 OK\r\n\r\n").is_ok());
  }

  #[test]
  fn oversized_heads_fail() {
    let mut transform = HttpHeadTransform::new(Direction::Request).with_max_head_length(16);
    assert!(matches!(
      transform.transform(b"GET / HTTP/1.1\r\nHost: far-too-long"),
      Err(HttpError::HeadTooLarge { max: 16 })
    ));
  }

  #[test]
  fn finish_returns_partial_heads() {
    let mut transform = HttpHeadTransform::new(Direction::Request);
    feed(&mut transform, b"GET / HT");
    assert_eq!(transform.finish(), b"GET / HT".to_vec());
  }
}
