//! Host/guest wire contract.
//!
//! [`RequestRecord`] is what a guest receives on stdin for every invocation,
//! and [`ResponseRecord`] is what the gateway recovers from the guest's
//! output. Both serialize as JSON using the field names of the original
//! protobuf schema (`Body`, `Method`, `URL`, ...), so guests built against
//! that schema decode them unchanged. Byte fields are base64, as in protobuf
//! JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{DeployId, EndpointId, InvocationId};

/// Multi-valued request headers, keyed by lowercase header name.
pub type HeaderMap = BTreeMap<String, HeaderValueList>;

/// Guest language / ABI tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// A WASI command module (e.g. compiled with `GOOS=wasip1`).
    Go,
    /// A script run by the shared JavaScript interpreter module.
    Js,
}

impl Runtime {
    /// The wire name of this runtime.
    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::Go => "go",
            Runtime::Js => "js",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "go" => Ok(Runtime::Go),
            "js" => Ok(Runtime::Js),
            other => Err(format!("unknown runtime '{other}' (expected 'go' or 'js')")),
        }
    }
}

/// Ordered values of one header name. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHeaderFields", into = "RawHeaderFields")]
pub struct HeaderValueList(Vec<String>);

#[derive(Serialize, Deserialize)]
struct RawHeaderFields {
    #[serde(default)]
    fields: Vec<String>,
}

impl TryFrom<RawHeaderFields> for HeaderValueList {
    type Error = String;

    fn try_from(raw: RawHeaderFields) -> Result<Self, Self::Error> {
        if raw.fields.is_empty() {
            return Err("header value list must not be empty".to_string());
        }
        Ok(Self(raw.fields))
    }
}

impl From<HeaderValueList> for RawHeaderFields {
    fn from(list: HeaderValueList) -> Self {
        Self { fields: list.0 }
    }
}

impl HeaderValueList {
    /// Create a list holding its first value.
    pub fn new(first: impl Into<String>) -> Self {
        Self(vec![first.into()])
    }

    /// Append a further value, keeping arrival order.
    pub fn push(&mut self, value: impl Into<String>) {
        self.0.push(value.into());
    }

    /// The first value.
    pub fn first(&self) -> &str {
        &self.0[0]
    }

    /// All values in arrival order.
    pub fn values(&self) -> &[String] {
        &self.0
    }

    /// Number of values (always at least one).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; present for API symmetry with collections.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Append `value` under `name`, creating the list on first use.
pub fn append_header(headers: &mut HeaderMap, name: &str, value: impl Into<String>) {
    let name = name.to_ascii_lowercase();
    match headers.get_mut(&name) {
        Some(list) => list.push(value),
        None => {
            headers.insert(name, HeaderValueList::new(value));
        }
    }
}

/// The serialized unit crossing into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Raw request body.
    #[serde(rename = "Body", with = "base64_bytes", default)]
    pub body: Vec<u8>,

    /// HTTP method.
    #[serde(rename = "Method")]
    pub method: String,

    /// Request URL (path and query).
    #[serde(rename = "URL")]
    pub url: String,

    /// Endpoint the request was addressed to.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: EndpointId,

    /// Unique id of this invocation.
    #[serde(rename = "ID")]
    pub invocation_id: InvocationId,

    /// Request headers, multi-valued.
    #[serde(rename = "Header", default)]
    pub headers: HeaderMap,

    /// Guest runtime tag.
    #[serde(rename = "runtime")]
    pub runtime: Runtime,

    /// Deploy being executed.
    #[serde(rename = "activeDeployID")]
    pub active_deploy_id: DeployId,

    /// Environment injected into the guest.
    #[serde(rename = "Env", default)]
    pub env: BTreeMap<String, String>,
}

impl RequestRecord {
    /// Encode the record as the JSON document written to guest stdin.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a record from its JSON form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The structured result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// Response body.
    #[serde(rename = "response", with = "base64_bytes", default)]
    pub body: Vec<u8>,

    /// HTTP status code.
    #[serde(rename = "statusCode")]
    pub status_code: u16,

    /// Echo of the request's invocation id.
    #[serde(rename = "RequestID")]
    pub invocation_id: InvocationId,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestRecord {
        let mut headers = HeaderMap::new();
        append_header(&mut headers, "Accept", "text/html");
        append_header(&mut headers, "accept", "application/json");

        RequestRecord {
            body: b"ping".to_vec(),
            method: "POST".into(),
            url: "/hello?x=1".into(),
            endpoint_id: EndpointId::new("e1"),
            invocation_id: InvocationId::new("inv-1"),
            headers,
            runtime: Runtime::Go,
            active_deploy_id: DeployId::new("d1"),
            env: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
        }
    }

    #[test]
    fn test_request_uses_protobuf_field_names() {
        let json: serde_json::Value =
            serde_json::from_slice(&sample_request().to_json().unwrap()).unwrap();

        assert_eq!(json["Body"], "cGluZw==");
        assert_eq!(json["Method"], "POST");
        assert_eq!(json["URL"], "/hello?x=1");
        assert_eq!(json["EndpointID"], "e1");
        assert_eq!(json["ID"], "inv-1");
        assert_eq!(json["runtime"], "go");
        assert_eq!(json["activeDeployID"], "d1");
        assert_eq!(json["Env"]["FOO"], "bar");
        assert_eq!(
            json["Header"]["accept"]["fields"],
            serde_json::json!(["text/html", "application/json"])
        );
    }

    #[test]
    fn test_request_decodes_from_json() {
        let original = sample_request();
        let decoded = RequestRecord::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_header_list_is_rejected() {
        let json = r#"{
            "Method": "GET", "URL": "/", "EndpointID": "e1", "ID": "i1",
            "Header": {"accept": {"fields": []}},
            "runtime": "go", "activeDeployID": "d1"
        }"#;
        assert!(RequestRecord::from_json(json.as_bytes()).is_err());
    }

    #[test]
    fn test_header_value_list_preserves_order() {
        let mut list = HeaderValueList::new("a");
        list.push("b");
        list.push("a");

        assert_eq!(list.first(), "a");
        assert_eq!(list.values(), ["a", "b", "a"]);
        assert_eq!(list.len(), 3);
        assert!(!list.is_empty());
    }

    #[test]
    fn test_runtime_parse() {
        assert_eq!("go".parse::<Runtime>(), Ok(Runtime::Go));
        assert_eq!("js".parse::<Runtime>(), Ok(Runtime::Js));
        assert!("python".parse::<Runtime>().is_err());
        assert_eq!(Runtime::Js.to_string(), "js");
    }

    #[test]
    fn test_response_record_json() {
        let record = ResponseRecord {
            body: b"hello".to_vec(),
            status_code: 200,
            invocation_id: InvocationId::new("inv-1"),
        };
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["response"], "aGVsbG8=");
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["RequestID"], "inv-1");
    }
}
