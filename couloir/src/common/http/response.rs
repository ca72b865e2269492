// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
pub const STATUS_OK: &str = "200 OK";
pub const STATUS_BAD_REQUEST: &str = "400 Bad Request";
pub const STATUS_NOT_FOUND: &str = "404 Not Found";
pub const STATUS_BAD_GATEWAY: &str = "502 Bad Gateway";

const LOGO: &str = r"   ___             _      _
  / __|___ _  _ __| |___ (_)_ _
 | (__/ _ \ || / _` / _ \| | '_|
  \___\___/\_,_\__,_\___/|_|_|";

/// Decorates a message with the couloir logo
pub fn banner(message: &str) -> String {
  format!("{}\n\n{}\n", LOGO, message)
}

/// A complete `Connection: close` response the relay or host can write before hanging up
///
/// Browsers asking for `text/html` get the body wrapped in a minimal page; every other
/// client gets it as plain text.
pub fn html_response(accept: Option<&str>, body: &str, status: &str) -> Vec<u8> {
  let wants_html = accept.map_or(false, |accept| accept.contains("text/html"));
  let (content_type, content) = if wants_html {
    (
      "text/html; charset=utf-8",
      format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Couloir</title></head>\
         <body><pre>{}</pre></body></html>\n",
        escape_html(body)
      ),
    )
  } else {
    ("text/plain; charset=utf-8", body.to_owned())
  };
  format!(
    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    status,
    content_type,
    content.len(),
    content
  )
  .into_bytes()
}

fn escape_html(text: &str) -> String {
  let mut escaped = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '&' => escaped.push_str("&amp;"),
      '<' => escaped.push_str("&lt;"),
      '>' => escaped.push_str("&gt;"),
      '"' => escaped.push_str("&quot;"),
      _ => escaped.push(c),
    }
  }
  escaped
}
