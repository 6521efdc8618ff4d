//! JSON message types exchanged between gateway and backend.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A forwarded HTTP request.
///
/// Wire form: `{"method":"POST","path":"/echo","headers":{"X-Test":"1"},"data":"hi"}`.
/// The body travels under the `data` key and is `null` for methods that do
/// not carry a payload. Missing keys decode to empty defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    method: String,

    #[serde(default)]
    path: String,

    #[serde(default)]
    headers: HashMap<String, String>,

    #[serde(rename = "data", default)]
    body: Option<String>,
}

impl Envelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Serializes the envelope as a JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses an envelope from a JSON document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Converts an already-parsed JSON document into an envelope.
    ///
    /// Fails when the document is valid JSON but not an object of the
    /// envelope's shape (for example an array, or a numeric `method`).
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// A backend reply: an arbitrary JSON object tagged with the producing role.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reply(Map<String, Value>);

impl Reply {
    /// Key under which the producing role identifies itself.
    pub const SERVER_KEY: &'static str = "server";

    /// Key carrying the failure description of an error reply.
    pub const ERROR_KEY: &'static str = "error";

    /// Creates a reply tagged with `server`.
    pub fn new(server: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(Self::SERVER_KEY.to_string(), Value::String(server.into()));
        Self(fields)
    }

    /// Creates an error reply: `{"error": <message>, "server": <server>}`.
    pub fn error(server: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(server).with(Self::ERROR_KEY, message)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the `server` tag, if present and a string.
    pub fn server(&self) -> Option<&str> {
        self.0.get(Self::SERVER_KEY).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.0.contains_key(Self::ERROR_KEY)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Serializes the reply as a JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl From<Map<String, Value>> for Reply {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new("POST", "/echo")
            .with_header("X-Test", "1")
            .with_body("hi");

        let value: Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"method": "POST", "path": "/echo", "headers": {"X-Test": "1"}, "data": "hi"})
        );
    }

    #[test]
    fn test_envelope_without_body_sends_null() {
        let envelope = Envelope::new("GET", "/");
        let value: Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["data"], Value::Null);
        assert_eq!(value["headers"], json!({}));
    }

    #[test]
    fn test_envelope_parses_deployed_format() {
        let envelope =
            Envelope::from_json(br#"{"method":"GET","path":"/","headers":{},"data":null}"#)
                .unwrap();
        assert_eq!(envelope.method(), "GET");
        assert_eq!(envelope.path(), "/");
        assert!(envelope.headers().is_empty());
        assert_eq!(envelope.body(), None);
    }

    #[test]
    fn test_envelope_missing_fields_default() {
        let envelope = Envelope::from_json(br#"{"path":"/status"}"#).unwrap();
        assert_eq!(envelope.method(), "");
        assert_eq!(envelope.path(), "/status");
        assert!(envelope.headers().is_empty());
        assert_eq!(envelope.body(), None);
    }

    #[test]
    fn test_envelope_wrong_shape() {
        assert!(Envelope::from_value(json!([1, 2, 3])).is_err());
        assert!(Envelope::from_value(json!({"method": 5})).is_err());
        assert!(Envelope::from_value(json!("GET /")).is_err());
    }

    #[test]
    fn test_envelope_invalid_json() {
        let err = Envelope::from_json(b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_reply_tagging() {
        let reply = Reply::new("enclave").with("message", "hello");
        assert_eq!(reply.server(), Some("enclave"));
        assert_eq!(reply.get("message"), Some(&json!("hello")));
        assert!(!reply.is_error());

        let value: Value = serde_json::from_slice(&reply.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"message": "hello", "server": "enclave"}));
    }

    #[test]
    fn test_error_reply() {
        let reply = Reply::error("enclave", "boom");
        assert!(reply.is_error());
        assert_eq!(reply.into_value(), json!({"error": "boom", "server": "enclave"}));
    }

    #[test]
    fn test_reply_from_map() {
        let map = json!({"status": "healthy"}).as_object().cloned().unwrap();
        let reply = Reply::from(map);
        assert_eq!(reply.server(), None);
        assert_eq!(reply.fields().len(), 1);
    }

    fn arb_envelope() -> impl Strategy<Value = Envelope> {
        (
            "[A-Z]{1,7}",
            "/[ -~]{0,32}",
            proptest::collection::hash_map("[A-Za-z-]{1,16}", any::<String>(), 0..8),
            proptest::option::of(any::<String>()),
        )
            .prop_map(|(method, path, headers, body)| {
                let envelope = Envelope::new(method, path).with_headers(headers);
                match body {
                    Some(b) => envelope.with_body(b),
                    None => envelope,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_envelope_roundtrip(envelope in arb_envelope()) {
            let encoded = envelope.to_json().unwrap();
            let decoded = Envelope::from_json(&encoded).unwrap();
            prop_assert_eq!(decoded, envelope);
        }
    }
}
