//! The three DAP envelope shapes the engine exchanges.
//!
//! Incoming requests keep their arguments as raw JSON for the dispatch
//! table to pick apart. Outgoing responses and events take their sequence
//! number explicitly; the server allocates it at send time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

static NO_ARGUMENTS: Value = Value::Null;

#[derive(Clone, Debug, Deserialize)]
pub struct Request {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl Request {
    /// The arguments object, or `Null` for requests sent without one.
    pub fn arguments(&self) -> &Value {
        self.arguments.as_ref().unwrap_or(&NO_ARGUMENTS)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Response {
    pub seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    pub request_seq: u64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// Success or failure reply to `request`, whichever `result` carries.
    pub fn reply(seq: u64, request: &Request, result: Result<Option<Value>, String>) -> Self {
        let (success, body, message) = match result {
            Ok(body) => (true, body, None),
            Err(message) => (false, None, Some(message)),
        };
        Self {
            seq,
            kind: "response",
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(seq: u64, event: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            seq,
            kind: "event",
            event: event.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(command: &str) -> Request {
        serde_json::from_value(json!({ "seq": 3, "type": "request", "command": command }))
            .unwrap()
    }

    #[test]
    fn missing_arguments_read_as_null() {
        let req = request("threads");
        assert_eq!(req.arguments(), &Value::Null);
        assert!(req.arguments().get("threadId").is_none());
    }

    #[test]
    fn failure_replies_carry_the_message_and_no_body() {
        let reply = Response::reply(8, &request("evaluate"), Err("no such frame".into()));
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            wire,
            json!({
                "seq": 8,
                "type": "response",
                "request_seq": 3,
                "success": false,
                "command": "evaluate",
                "message": "no such frame",
            })
        );
    }

    #[test]
    fn success_replies_omit_the_message() {
        let reply = Response::reply(9, &request("threads"), Ok(Some(json!({ "threads": [] }))));
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["success"], true);
        assert_eq!(wire["body"], json!({ "threads": [] }));
        assert!(wire.get("message").is_none());
    }

    #[test]
    fn events_serialize_with_the_event_type_tag() {
        let wire = serde_json::to_value(Event::new(2, "initialized", None)).unwrap();
        assert_eq!(wire, json!({ "seq": 2, "type": "event", "event": "initialized" }));
    }
}
