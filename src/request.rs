use std::net::IpAddr;

use http::Method;
use serde_json::{Map, Value};

/// Common representation of an inbound request after the codec has parsed the
/// request line, sanitized the headers, and decoded the edge metadata bag.
///
/// The evaluation path treats this as an immutable value; everything the rule
/// engine can see is derived from these fields.
#[derive(Debug, Clone)]
pub struct WafRequest {
    pub method: Method,
    /// Origin-form target, path plus optional query.
    pub target: String,
    /// Lowercased host from the `Host` header.
    pub host: String,
    /// All observed request headers, names lowercased, in arrival order.
    pub headers: Vec<(String, String)>,
    /// Opaque attribute bag populated by the edge (network, geo, bot, TLS
    /// signals). Values are scalars or nested objects of scalars.
    pub meta: Map<String, Value>,
    pub peer: IpAddr,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl WafRequest {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == lower_name)
            .map(|(_, value)| value.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// Scalar meta attribute rendered as text, for event records.
    pub fn meta_text(&self, key: &str) -> Option<String> {
        match self.meta.get(key) {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Number(number)) => Some(number.to_string()),
            Some(Value::Bool(flag)) => Some(flag.to_string()),
            _ => None,
        }
    }
}
