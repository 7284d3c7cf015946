//! The small part of JSON-RPC 2.0 the control socket needs

use crate::errors::SupervisorError;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl Call {
    pub fn from_json(val: &Value) -> Result<Call, String> {
        let map = match val {
            Value::Object(map) => map,
            _ => return Err("Value wasn't an object".into()),
        };
        let method = match map.get("method") {
            Some(Value::String(method)) => method.clone(),
            Some(_) => return Err("method was not a string".into()),
            None => return Err("No method name given".into()),
        };
        Ok(Call {
            method,
            params: map.get("params").cloned(),
            id: map.get("id").cloned(),
        })
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), "2.0".into());
        map.insert("method".into(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            map.insert("params".into(), params.clone());
        }
        if let Some(id) = &self.id {
            map.insert("id".into(), id.clone());
        }
        Value::Object(map)
    }
}

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST_ERROR: i64 = -32600;
pub const METHOD_NOT_FOUND_ERROR: i64 = -32601;
pub const INVALID_PARAMS_ERROR: i64 = -32602;
/// Supervisor errors are reported as SERVER_ERROR - code()
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

pub fn make_error(code: i64, message: String, data: Option<Value>) -> Error {
    Error {
        code,
        message,
        data,
    }
}

impl From<&SupervisorError> for Error {
    fn from(err: &SupervisorError) -> Self {
        make_error(
            SERVER_ERROR - err.code(),
            err.to_string(),
            Some(json!({ "kind": err.kind() })),
        )
    }
}

pub fn make_result_response(id: Option<Value>, result: Value) -> Value {
    let mut response = Map::new();
    response.insert("jsonrpc".into(), "2.0".into());
    response.insert("result".into(), result);
    if let Some(id) = id {
        response.insert("id".into(), id);
    }
    Value::Object(response)
}

pub fn make_error_response(id: Option<Value>, error: Error) -> Value {
    let mut json_err = Map::new();
    json_err.insert("code".into(), Value::from(error.code));
    json_err.insert("message".into(), Value::String(error.message));
    if let Some(data) = error.data {
        json_err.insert("data".into(), data);
    }

    let mut response = Map::new();
    response.insert("jsonrpc".into(), "2.0".into());
    response.insert("error".into(), Value::Object(json_err));
    if let Some(id) = id {
        response.insert("id".into(), id);
    }
    Value::Object(response)
}

/// Read the next call from the stream. None if the stream ended cleanly. The outer error is a json
/// error, the inner one a value that is not a call.
pub fn get_next_call(
    source: &mut dyn std::io::Read,
) -> Option<serde_json::Result<Result<Call, String>>> {
    serde_json::Deserializer::from_reader(source)
        .into_iter::<Value>()
        .next()
        .map(|value| value.map(|value| Call::from_json(&value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_and_errors() {
        let call = Call::from_json(&json!({"jsonrpc": "2.0", "method": "stop", "params": "web", "id": 3})).unwrap();
        assert_eq!(call.method, "stop");
        assert_eq!(call.params, Some(json!("web")));
        assert_eq!(call.id, Some(json!(3)));
        assert!(Call::from_json(&json!({"params": 1})).is_err());
        assert!(Call::from_json(&json!([1, 2])).is_err());

        let err = Error::from(&SupervisorError::NotFound("web".into()));
        let response = make_error_response(Some(json!(3)), err);
        assert_eq!(response["error"]["code"], json!(SERVER_ERROR - 1));
        assert_eq!(response["error"]["data"]["kind"], json!("NotFound"));
        assert_eq!(response["id"], json!(3));
    }

    #[test]
    fn reads_consecutive_calls() {
        let input = br#"{"method": "list"} {"method": "ping", "params": "web"}"#;
        let mut reader = &input[..];
        assert_eq!(get_next_call(&mut reader).unwrap().unwrap().unwrap().method, "list");
        assert_eq!(get_next_call(&mut reader).unwrap().unwrap().unwrap().method, "ping");
        assert!(get_next_call(&mut reader).is_none());
    }
}
