//! Transport-neutral request and response types that flow through the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Header map with lower-cased names.
pub type Headers = BTreeMap<String, String>;

/// Header stamped on every response that was not served live by the network.
pub const OFFLINE_SOURCE_HEADER: &str = "x-offline-source";

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Some(Self::Get),
      "HEAD" => Some(Self::Head),
      "OPTIONS" => Some(Self::Options),
      "POST" => Some(Self::Post),
      "PUT" => Some(Self::Put),
      "PATCH" => Some(Self::Patch),
      "DELETE" => Some(Self::Delete),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Options => "OPTIONS",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }

  /// Whether requests with this method mutate server state and may be queued.
  pub fn is_write(&self) -> bool {
    matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What kind of resource the caller expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  /// Top-level navigation
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  Other,
}

impl Destination {
  /// Map a `Sec-Fetch-Dest` header value.
  pub fn from_fetch_dest(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "document" | "iframe" => Self::Document,
      "image" => Self::Image,
      "script" | "worker" => Self::Script,
      "style" => Self::Style,
      "font" => Self::Font,
      _ => Self::Other,
    }
  }

  /// Best-effort guess from the URL path extension.
  pub fn guess(url: &Url) -> Self {
    let path = url.path();
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
      Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif") => Self::Image,
      Some("js" | "mjs") => Self::Script,
      Some("css") => Self::Style,
      Some("woff" | "woff2" | "ttf" | "otf" | "eot") => Self::Font,
      Some("html" | "htm") => Self::Document,
      _ => Self::Other,
    }
  }
}

/// An outgoing request as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Vec<u8>,
  destination: Option<Destination>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: Vec::new(),
      destination: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn with_json(self, value: &Value) -> Self {
    self
      .with_header("content-type", "application/json")
      .with_body(value.to_string())
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = Some(destination);
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  /// Explicit destination, else `Sec-Fetch-Dest`, else a guess from the path.
  pub fn destination(&self) -> Destination {
    if let Some(destination) = self.destination {
      return destination;
    }
    match self.header("sec-fetch-dest") {
      Some(dest) => Destination::from_fetch_dest(dest),
      None => Destination::guess(&self.url),
    }
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// A response, either received from the network or synthesized locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// Empty 200, used as the stand-in for unreachable images.
  pub fn empty_ok() -> Self {
    Self::new(200, Vec::new())
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  pub fn body_json(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}
