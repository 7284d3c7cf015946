use super::api;
use super::jsonrpc2::{self, Call};
use crate::errors::SupervisorError;
use crate::runtime_info::RuntimeInfo;

use log::{trace, warn};
use serde_json::Value;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Bind the control socket, replacing a stale one
pub fn open_control_socket(path: &Path) -> Result<UnixListener, String> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Error creating dir {:?} for the control socket: {}", dir, e))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| format!("Error removing stale control socket {:?}: {}", path, e))?;
    }
    UnixListener::bind(path).map_err(|e| format!("Error binding control socket {:?}: {}", path, e))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(String),
    Stop(String),
    Restart(String),
    Reload(String),
    Enable(String),
    Disable(String),
    Mask(String),
    Unmask(String),
    Status(Option<String>),
    List,
    Ping(String),
    Maintenance(String, bool),
    Load(PathBuf),
    Unload(String),
    Shutdown,
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    MethodNotFound(String),
    ParamsInvalid(String),
}

/// Params may be missing, a single string or a list of strings
fn string_params(params: &Option<Value>) -> Result<Vec<String>, ParseError> {
    match params {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| match value {
                Value::String(s) => Ok(s.clone()),
                _ => Err(ParseError::ParamsInvalid(
                    "Params must be strings".to_owned(),
                )),
            })
            .collect(),
        Some(_) => Err(ParseError::ParamsInvalid(
            "Params must be a string or a list of strings".to_owned(),
        )),
    }
}

fn single_name(method: &str, params: Vec<String>) -> Result<String, ParseError> {
    let mut params = params;
    if params.len() != 1 || params[0].is_empty() {
        return Err(ParseError::ParamsInvalid(format!(
            "{} needs exactly one service name",
            method
        )));
    }
    Ok(params.remove(0))
}

pub fn parse_command(call: &Call) -> Result<Command, ParseError> {
    let params = string_params(&call.params)?;
    let method = call.method.as_str();
    let command = match method {
        "start" => Command::Start(single_name(method, params)?),
        "stop" => Command::Stop(single_name(method, params)?),
        "restart" => Command::Restart(single_name(method, params)?),
        "reload" => Command::Reload(single_name(method, params)?),
        "enable" => Command::Enable(single_name(method, params)?),
        "disable" => Command::Disable(single_name(method, params)?),
        "mask" => Command::Mask(single_name(method, params)?),
        "unmask" => Command::Unmask(single_name(method, params)?),
        "ping" => Command::Ping(single_name(method, params)?),
        "unload" => Command::Unload(single_name(method, params)?),
        "load" => Command::Load(PathBuf::from(single_name(method, params)?)),
        "status" => match params.len() {
            0 => Command::Status(None),
            1 => Command::Status(params.into_iter().next()),
            _ => {
                return Err(ParseError::ParamsInvalid(
                    "status takes at most one service name".to_owned(),
                ))
            }
        },
        "list" => Command::List,
        "maintenance" => match params.as_slice() {
            [name, mode] if mode == "on" => Command::Maintenance(name.clone(), true),
            [name, mode] if mode == "off" => Command::Maintenance(name.clone(), false),
            _ => {
                return Err(ParseError::ParamsInvalid(
                    "maintenance needs a service name and on|off".to_owned(),
                ))
            }
        },
        "shutdown" => Command::Shutdown,
        _ => return Err(ParseError::MethodNotFound(call.method.clone())),
    };
    Ok(command)
}

fn done() -> Value {
    Value::String("ok".to_owned())
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, SupervisorError> {
    serde_json::to_value(value)
        .map_err(|e| SupervisorError::SystemFailure(format!("serializing the answer: {}", e)))
}

pub fn execute_command(cmd: Command, run_info: &RuntimeInfo) -> Result<Value, SupervisorError> {
    match cmd {
        Command::Start(name) => api::start(run_info, &name).map(|_| done()),
        Command::Stop(name) => api::stop(run_info, &name).map(|outcome| {
            Value::String(format!("{:?}", outcome))
        }),
        Command::Restart(name) => api::restart(run_info, &name).map(|_| done()),
        Command::Reload(name) => api::reload(run_info, &name).map(|_| done()),
        Command::Enable(name) => api::enable(run_info, &name).map(|_| done()),
        Command::Disable(name) => api::disable(run_info, &name).map(|_| done()),
        Command::Mask(name) => api::mask(run_info, &name).map(|_| done()),
        Command::Unmask(name) => api::unmask(run_info, &name).map(|_| done()),
        Command::Ping(name) => api::ping(run_info, &name).map(|_| done()),
        Command::Maintenance(name, on) => api::maintenance(run_info, &name, on).map(|_| done()),
        Command::Status(Some(name)) => to_value(api::status(run_info, &name)?),
        Command::Status(None) | Command::List => to_value(api::list(run_info)),
        Command::Load(path) => api::load(run_info, &path).map(Value::String),
        Command::Unload(name) => api::unload(run_info, &name).map(|_| done()),
        Command::Shutdown => {
            api::shutdown(run_info);
            Ok(Value::String("shutting down".to_owned()))
        }
    }
}

/// Malformed requests carry the same kind as a rejected argument
fn invalid_argument() -> Option<Value> {
    Some(serde_json::json!({ "kind": "InvalidArgument" }))
}

/// Answer one call. Returns None if the stream ended.
fn answer_next_call(source: &mut UnixStream, run_info: &RuntimeInfo) -> Option<Value> {
    let call = match jsonrpc2::get_next_call(source)? {
        Err(e) => {
            if e.is_io() {
                trace!("Control connection failed: {}", e);
                return None;
            }
            let err = jsonrpc2::make_error(jsonrpc2::PARSE_ERROR, e.to_string(), None);
            return Some(jsonrpc2::make_error_response(None, err));
        }
        Ok(Err(e)) => {
            let err = jsonrpc2::make_error(jsonrpc2::INVALID_REQUEST_ERROR, e, None);
            return Some(jsonrpc2::make_error_response(None, err));
        }
        Ok(Ok(call)) => call,
    };
    let response = match parse_command(&call) {
        Err(ParseError::ParamsInvalid(msg)) => jsonrpc2::make_error_response(
            call.id,
            jsonrpc2::make_error(jsonrpc2::INVALID_PARAMS_ERROR, msg, invalid_argument()),
        ),
        Err(ParseError::MethodNotFound(method)) => jsonrpc2::make_error_response(
            call.id,
            jsonrpc2::make_error(
                jsonrpc2::METHOD_NOT_FOUND_ERROR,
                format!("Unknown command: {}", method),
                invalid_argument(),
            ),
        ),
        Ok(cmd) => {
            trace!("Execute command: {:?}", cmd);
            match execute_command(cmd, run_info) {
                Ok(result) => jsonrpc2::make_result_response(call.id, result),
                Err(e) => jsonrpc2::make_error_response(call.id, jsonrpc2::Error::from(&e)),
            }
        }
    };
    Some(response)
}

/// Serve calls on a control connection until the client closes it. Runs on a worker.
pub fn serve_connection(mut stream: UnixStream, run_info: &RuntimeInfo) {
    while let Some(response) = answer_next_call(&mut stream, run_info) {
        let written = serde_json::to_vec_pretty(&response)
            .map_err(|e| e.to_string())
            .and_then(|bytes| stream.write_all(&bytes).map_err(|e| e.to_string()));
        if let Err(e) = written {
            warn!("Error while answering on the control socket: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(method: &str, params: Option<Value>) -> Call {
        Call {
            method: method.to_owned(),
            params,
            id: None,
        }
    }

    #[test]
    fn parse_commands() {
        assert_eq!(
            parse_command(&call("stop", Some(json!("web")))),
            Ok(Command::Stop("web".to_owned()))
        );
        assert_eq!(
            parse_command(&call("maintenance", Some(json!(["db", "on"])))),
            Ok(Command::Maintenance("db".to_owned(), true))
        );
        assert_eq!(parse_command(&call("status", None)), Ok(Command::Status(None)));
        assert_eq!(
            parse_command(&call("load", Some(json!("/etc/neoinit/units/a.toml")))),
            Ok(Command::Load(PathBuf::from("/etc/neoinit/units/a.toml")))
        );
    }

    #[test]
    fn malformed_commands() {
        assert!(matches!(
            parse_command(&call("start", None)),
            Err(ParseError::ParamsInvalid(_))
        ));
        assert!(matches!(
            parse_command(&call("start", Some(json!(["a", "b"])))),
            Err(ParseError::ParamsInvalid(_))
        ));
        assert!(matches!(
            parse_command(&call("start", Some(json!(5)))),
            Err(ParseError::ParamsInvalid(_))
        ));
        assert!(matches!(
            parse_command(&call("maintenance", Some(json!(["db", "maybe"])))),
            Err(ParseError::ParamsInvalid(_))
        ));
        assert_eq!(
            parse_command(&call("explode", None)),
            Err(ParseError::MethodNotFound("explode".to_owned()))
        );
    }
}
