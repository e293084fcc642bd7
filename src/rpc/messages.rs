//! RPC message shapes
//!
//! Three document forms travel over a console connection: requests,
//! answers and signals. Answers carry the id of the request they resolve;
//! signals are fire-and-forget and carry no id.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Answer state
pub const STATE_OK: &str = "OK";
pub const STATE_ERROR: &str = "error";
pub const STATE_INTERRUPT: &str = "interrupt";

/// A method invocation sent by a console
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: i64,
}

impl RpcRequest {
    /// Build a request stamped with the current unix time
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Positional string parameter accessor
    pub fn param_str(&self, index: usize) -> Result<&str> {
        self.params
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::WrongArgCount(self.method.clone()))
    }

    /// Reject any call whose parameter count differs from `expected`
    pub fn expect_params(&self, expected: usize) -> Result<()> {
        if self.params.len() != expected {
            return Err(Error::WrongArgCount(self.method.clone()));
        }
        Ok(())
    }
}

/// Parse and validate a request document
pub fn loads_request(raw: &str) -> Result<RpcRequest> {
    let value: Value =
        serde_json::from_str(raw).map_err(|_| Error::Protocol("Malformed request".to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::Protocol("Malformed request".to_string()))?;
    for key in ["method", "params", "id"] {
        if !object.contains_key(key) {
            return Err(Error::Protocol("Malformed request".to_string()));
        }
    }
    serde_json::from_value(value).map_err(|_| Error::Protocol("Malformed request".to_string()))
}

/// The single answer resolving a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcAnswer {
    #[serde(rename = "type")]
    pub kind: String,
    pub state: String,
    pub content: Value,
    pub id: Option<i64>,
}

impl RpcAnswer {
    pub fn ok(id: Option<i64>, content: Value) -> Self {
        Self {
            kind: "answer".to_string(),
            state: STATE_OK.to_string(),
            content,
            id,
        }
    }

    pub fn error(id: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            state: STATE_ERROR.to_string(),
            content: Value::String(message.into()),
            id,
        }
    }

    pub fn interrupt(id: Option<i64>) -> Self {
        Self {
            kind: "answer".to_string(),
            state: STATE_INTERRUPT.to_string(),
            content: Value::String(String::new()),
            id,
        }
    }
}

/// An unsolicited progress or event notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSignal {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub attrs: Value,
    pub id: Option<i64>,
}

impl RpcSignal {
    pub fn new(name: &str, attrs: Value) -> Self {
        Self {
            kind: "signal".to_string(),
            name: name.to_string(),
            attrs,
            id: None,
        }
    }
}

/// Parse a server-to-console document, keeping only the shared keys
pub fn loads_response(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| Error::Protocol("Malformed response".to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::Protocol("Malformed response".to_string()))?;
    for key in ["type", "id"] {
        if !object.contains_key(key) {
            return Err(Error::Protocol("Malformed response".to_string()));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = RpcRequest::new("start", vec![json!("R1")]);
        let raw = serde_json::to_string(&request).unwrap();
        let parsed = loads_request(&raw).unwrap();
        assert_eq!(parsed.method, "start");
        assert_eq!(parsed.param_str(0).unwrap(), "R1");
        assert_eq!(parsed.id, request.id);
    }

    #[test]
    fn test_request_missing_key_rejected() {
        assert!(loads_request(r#"{"method": "load", "params": []}"#).is_err());
        assert!(loads_request("[1, 2]").is_err());
        assert!(loads_request("not json").is_err());
    }

    #[test]
    fn test_answer_shape() {
        let answer = RpcAnswer::ok(Some(17), json!({"running": true}));
        let value: Value = serde_json::from_str(&serde_json::to_string(&answer).unwrap()).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["state"], "OK");
        assert_eq!(value["id"], 17);
        assert_eq!(value["content"]["running"], true);
    }

    #[test]
    fn test_interrupt_answer_state() {
        let answer = RpcAnswer::interrupt(Some(3));
        assert_eq!(answer.state, STATE_INTERRUPT);
    }

    #[test]
    fn test_signal_has_no_id() {
        let signal = RpcSignal::new("node_state", json!({"name": "R1"}));
        let value: Value = serde_json::from_str(&serde_json::to_string(&signal).unwrap()).unwrap();
        assert_eq!(value["type"], "signal");
        assert!(value["id"].is_null());
    }

    #[test]
    fn test_expect_params() {
        let request = RpcRequest::new("ifstate", vec![json!("R1.0"), json!("up")]);
        assert!(request.expect_params(2).is_ok());
        assert!(request.expect_params(1).is_err());
    }
}
