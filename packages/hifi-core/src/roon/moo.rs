//! MOO/1 message codec.
//!
//! A MOO message is an HTTP-like text block carried in one WebSocket frame:
//!
//! ```text
//! MOO/1 REQUEST com.roonlabs.registry:1/info
//! Request-Id: 0
//! Content-Length: 2
//! Content-Type: application/json
//!
//! {}
//! ```
//!
//! Requests name `service/method`; responses (`CONTINUE`, `COMPLETE`) carry a
//! status name such as `Success`, `Subscribed` or `Changed` and echo the
//! request id.

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{MooError, MooResult};

const PROTOCOL: &str = "MOO/1";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Final statuses that report success.
const SUCCESS_STATUSES: &[&str] = &["Success", "Registered", "Unsubscribed"];

/// First word after `MOO/1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MooVerb {
    Request,
    /// Intermediate response; more may follow for the same id.
    Continue,
    /// Final response for the id.
    Complete,
}

impl MooVerb {
    fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Continue => "CONTINUE",
            Self::Complete => "COMPLETE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUEST" => Some(Self::Request),
            "CONTINUE" => Some(Self::Continue),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for MooVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded MOO message.
#[derive(Debug, Clone, PartialEq)]
pub struct MooMessage {
    pub verb: MooVerb,
    /// `service/method` for requests, status name for responses.
    pub name: String,
    pub request_id: u64,
    pub body: Option<Value>,
}

impl MooMessage {
    #[must_use]
    pub fn request(request_id: u64, name: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            verb: MooVerb::Request,
            name: name.into(),
            request_id,
            body,
        }
    }

    #[must_use]
    pub fn complete(request_id: u64, name: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            verb: MooVerb::Complete,
            name: name.into(),
            request_id,
            body,
        }
    }

    /// True for a `COMPLETE` carrying a failure status (`InvalidRequest`,
    /// `NotRegistered`, ...).
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.verb == MooVerb::Complete && !SUCCESS_STATUSES.contains(&self.name.as_str())
    }

    /// Deserializes the body (an absent body reads as `null`).
    ///
    /// # Errors
    /// `Json` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> MooResult<T> {
        Ok(serde_json::from_value(
            self.body.clone().unwrap_or(Value::Null),
        )?)
    }

    /// Serializes to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\nRequest-Id: {}\n",
            PROTOCOL, self.verb, self.name, self.request_id
        );
        match &self.body {
            Some(body) => {
                let json = body.to_string();
                out.push_str(&format!(
                    "Content-Length: {}\nContent-Type: {}\n\n",
                    json.len(),
                    JSON_CONTENT_TYPE
                ));
                out.push_str(&json);
            }
            None => out.push('\n'),
        }
        out.into_bytes()
    }

    /// Parses wire bytes.
    ///
    /// # Errors
    /// `Malformed` for a bad first line, a missing `Request-Id` or a
    /// truncated body; `Json` for an unparsable JSON body.
    pub fn decode(data: &[u8]) -> MooResult<Self> {
        let (head_len, body_start) = match find(data, b"\n\n") {
            Some(pos) => (pos, pos + 2),
            None => (data.len(), data.len()),
        };
        let head = std::str::from_utf8(&data[..head_len])
            .map_err(|_| MooError::Malformed("header is not UTF-8".into()))?;
        let mut lines = head.lines();

        let first = lines
            .next()
            .ok_or_else(|| MooError::Malformed("empty message".into()))?;
        let mut parts = first.splitn(3, ' ');
        if parts.next() != Some(PROTOCOL) {
            return Err(MooError::Malformed(format!("bad first line: {:?}", first)));
        }
        let verb = parts
            .next()
            .and_then(MooVerb::parse)
            .ok_or_else(|| MooError::Malformed(format!("bad verb: {:?}", first)))?;
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| MooError::Malformed(format!("missing name: {:?}", first)))?
            .to_string();

        let mut request_id = None;
        let mut content_length = None;
        let mut content_type = None;
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                return Err(MooError::Malformed(format!("bad header: {:?}", line)));
            };
            let value = value.trim();
            match key.trim() {
                "Request-Id" => request_id = value.parse::<u64>().ok(),
                "Content-Length" => content_length = value.parse::<usize>().ok(),
                "Content-Type" => content_type = Some(value.to_string()),
                _ => {}
            }
        }
        let request_id =
            request_id.ok_or_else(|| MooError::Malformed("missing Request-Id".into()))?;

        let rest = &data[body_start..];
        let body_bytes = match content_length {
            Some(len) if len > rest.len() => {
                return Err(MooError::Malformed(format!(
                    "body truncated: {} of {} bytes",
                    rest.len(),
                    len
                )))
            }
            Some(len) => &rest[..len],
            None => rest,
        };

        let body = if body_bytes.is_empty() {
            None
        } else if content_type.map_or(true, |t| t.starts_with(JSON_CONTENT_TYPE)) {
            Some(serde_json::from_slice(body_bytes)?)
        } else {
            return Err(MooError::Malformed("non-JSON body".into()));
        };

        Ok(Self {
            verb,
            name,
            request_id,
            body,
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_encodes_headers_and_body() {
        let msg = MooMessage::request(
            3,
            "com.roonlabs.transport:2/control",
            Some(json!({"zone_or_output_id": "z1", "control": "play"})),
        );
        let wire = String::from_utf8(msg.encode()).unwrap();
        assert!(wire.starts_with("MOO/1 REQUEST com.roonlabs.transport:2/control\nRequest-Id: 3\n"));
        assert!(wire.contains("Content-Type: application/json\n\n{"));
        assert_eq!(MooMessage::decode(wire.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn bodiless_message_decodes() {
        let wire = b"MOO/1 COMPLETE Success\nRequest-Id: 12\n\n";
        let msg = MooMessage::decode(wire).unwrap();
        assert_eq!(msg.verb, MooVerb::Complete);
        assert_eq!(msg.name, "Success");
        assert_eq!(msg.request_id, 12);
        assert!(msg.body.is_none());
        assert!(!msg.is_error());
    }

    #[test]
    fn core_ping_request_decodes() {
        let wire = b"MOO/1 REQUEST com.roonlabs.ping:1/ping\nRequest-Id: 77\n\n";
        let msg = MooMessage::decode(wire).unwrap();
        assert_eq!(msg.verb, MooVerb::Request);
        assert_eq!(msg.name, "com.roonlabs.ping:1/ping");
    }

    #[test]
    fn content_length_bounds_the_body() {
        let wire = b"MOO/1 CONTINUE Changed\nRequest-Id: 1\nContent-Length: 2\nContent-Type: application/json\n\n{}trailing";
        let msg = MooMessage::decode(wire).unwrap();
        assert_eq!(msg.body, Some(json!({})));

        let short = b"MOO/1 CONTINUE Changed\nRequest-Id: 1\nContent-Length: 50\n\n{}";
        assert!(matches!(MooMessage::decode(short), Err(MooError::Malformed(_))));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(
            MooMessage::decode(b"HTTP/1.1 200 OK\n\n"),
            Err(MooError::Malformed(_))
        ));
        assert!(matches!(
            MooMessage::decode(b"MOO/1 COMPLETE Success\n\n"),
            Err(MooError::Malformed(_))
        ));
        assert!(matches!(
            MooMessage::decode(b"MOO/1 COMPLETE Success\nRequest-Id: 1\nContent-Type: application/json\n\n{nope"),
            Err(MooError::Json(_))
        ));
    }

    #[test]
    fn error_status_is_detected() {
        let msg = MooMessage::complete(4, "InvalidRequest", Some(json!({"error": "bad zone"})));
        assert!(msg.is_error());
        assert!(!MooMessage::complete(5, "Registered", None).is_error());
    }
}
