// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use super::HttpError;

pub const HEAD_SEPARATOR: &[u8] = b"\r\n\r\n";
pub const MAX_HEAD_LENGTH: usize = 64 * 1024;

/// Headers parsed per head; longer heads are refused
pub const MAX_HEADERS: usize = 128;

/// Start line and headers of an HTTP/1.x request or response
///
/// Unmodified heads serialize back to their exact original bytes; header edits
/// switch serialization to a canonical `Name: value\r\n` layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessageHead {
  start_line: String,
  kind: StartLine,
  headers: Vec<(String, String)>,
  raw: Vec<u8>,
  modified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartLine {
  Request {
    method: String,
    path: String,
    version: u8,
  },
  Response {
    status: u16,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
  pub method: &'a str,
  pub path: &'a str,
  pub version: &'a str,
}

fn invalid(error: httparse::Error) -> HttpError {
  HttpError::InvalidHead(error.to_string())
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>, HttpError> {
  headers
    .iter()
    .map(|header| {
      let value = std::str::from_utf8(header.value).map_err(|_| {
        HttpError::InvalidHead(format!("header {} is not valid UTF-8", header.name))
      })?;
      Ok((header.name.to_owned(), value.trim().to_owned()))
    })
    .collect()
}

impl HttpMessageHead {
  /// Parses a head, excluding its terminating blank line
  pub fn parse(raw: &[u8]) -> Result<Self, HttpError> {
    let mut complete = Vec::with_capacity(raw.len() + HEAD_SEPARATOR.len());
    complete.extend_from_slice(raw);
    complete.extend_from_slice(HEAD_SEPARATOR);
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (kind, headers) = if raw.starts_with(b"HTTP/") {
      let mut response = httparse::Response::new(&mut headers);
      match response.parse(&complete).map_err(invalid)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
          return Err(HttpError::InvalidHead(String::from("incomplete status line")))
        }
      }
      let status = response.code.unwrap_or_default();
      (StartLine::Response { status }, collect_headers(response.headers)?)
    } else {
      let mut request = httparse::Request::new(&mut headers);
      match request.parse(&complete).map_err(invalid)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
          return Err(HttpError::InvalidHead(String::from("incomplete request line")))
        }
      }
      let kind = StartLine::Request {
        method: request.method.unwrap_or_default().to_owned(),
        path: request.path.unwrap_or_default().to_owned(),
        version: request.version.unwrap_or(1),
      };
      (kind, collect_headers(request.headers)?)
    };
    let line_end = raw
      .windows(2)
      .position(|window| window == b"\r\n")
      .unwrap_or(raw.len());
    let start_line = String::from_utf8_lossy(&raw[..line_end]).trim().to_owned();
    Ok(Self {
      start_line,
      kind,
      headers,
      raw: raw.to_vec(),
      modified: false,
    })
  }

  pub fn start_line(&self) -> &str {
    &self.start_line
  }

  pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .headers
      .iter()
      .map(|(name, value)| (name.as_str(), value.as_str()))
  }

  /// First value of the named header, matched case-insensitively
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .headers
      .iter()
      .filter(move |(candidate, _)| candidate.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  /// Replaces every occurrence of the named header with a single value, appending it if absent
  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    let value = value.into();
    let mut seen = false;
    self.headers.retain_mut(|(candidate, existing)| {
      if !candidate.eq_ignore_ascii_case(name) {
        return true;
      }
      if seen {
        return false;
      }
      seen = true;
      *existing = value.clone();
      true
    });
    if !seen {
      self.headers.push((name.to_owned(), value));
    }
    self.modified = true;
  }

  pub fn remove_header(&mut self, name: &str) -> bool {
    let before = self.headers.len();
    self
      .headers
      .retain(|(candidate, _)| !candidate.eq_ignore_ascii_case(name));
    let removed = self.headers.len() != before;
    self.modified |= removed;
    removed
  }

  pub fn is_modified(&self) -> bool {
    self.modified
  }

  pub fn request_line(&self) -> Option<RequestLine<'_>> {
    match &self.kind {
      StartLine::Request {
        method,
        path,
        version,
      } => Some(RequestLine {
        method,
        path,
        version: match version {
          0 => "HTTP/1.0",
          _ => "HTTP/1.1",
        },
      }),
      StartLine::Response { .. } => None,
    }
  }

  /// Status code, for response heads
  pub fn status(&self) -> Option<u16> {
    match self.kind {
      StartLine::Response { status } => Some(status),
      StartLine::Request { .. } => None,
    }
  }

  /// The `Host` header, without any port
  pub fn host(&self) -> Option<&str> {
    self
      .header("host")
      .map(strip_port)
      .filter(|host| !host.is_empty())
  }

  pub fn is_websocket_upgrade(&self) -> bool {
    self.header_values("upgrade").any(|value| {
      value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    })
  }

  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map_or(false, |accept| accept.contains("text/html"))
  }

  /// Serialized head, including the terminating blank line
  pub fn to_bytes(&self) -> Vec<u8> {
    if !self.modified {
      let mut bytes = Vec::with_capacity(self.raw.len() + HEAD_SEPARATOR.len());
      bytes.extend_from_slice(&self.raw);
      bytes.extend_from_slice(HEAD_SEPARATOR);
      return bytes;
    }
    let mut out = String::with_capacity(self.raw.len() + 64);
    out.push_str(&self.start_line);
    out.push_str("\r\n");
    for (name, value) in &self.headers {
      out.push_str(name);
      out.push_str(": ");
      out.push_str(value);
      out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
  }
}

/// Drops a trailing `:port`, keeping bracketed IPv6 literals intact
pub fn strip_port(host: &str) -> &str {
  if host.starts_with('[') {
    return match host.find(']') {
      Some(end) => &host[..=end],
      None => host,
    };
  }
  match host.rsplit_once(':') {
    Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
    _ => host,
  }
}
