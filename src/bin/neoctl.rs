//! NEOCTL
//! This is a utility to pack cli args into the jsonrpc2 format and send them to neoinit.
//! It will read the answer and pretty print it.
//!
//! Note that this doesn't check the correctness of commands and their args, this is done by neoinit itself

use neoinit::control::jsonrpc2::Call;
use serde_json::Value;
use std::io::Write;
use std::os::unix::net::UnixStream;

const DEFAULT_ADDR: &str = "/run/neoinit.sock";

const USAGE: &str = "
This is a utility to pack cli args into the jsonrpc2 format and send them to neoinit.
It will read the answer and pretty print it.

Usage:
    neoctl [--addr <socket>] <command> [args]

The socket can also be set with NEOCTL_ADDR, it defaults to /run/neoinit.sock

Example:
    neoctl restart webserver
    neoctl maintenance webserver on
";

fn run(mut args: Vec<String>) -> Result<Value, String> {
    let addr = if args.first().map(String::as_str) == Some("--addr") {
        if args.len() < 2 {
            return Err("--addr needs a value".into());
        }
        args.remove(0);
        args.remove(0)
    } else {
        std::env::var("NEOCTL_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_owned())
    };
    if args.is_empty() {
        return Err("No command given".into());
    }

    let method = args.remove(0);
    let params = match args.len() {
        0 => None,
        1 => Some(Value::String(args.remove(0))),
        _ => Some(args.into_iter().map(Value::String).collect()),
    };
    let call = Call {
        method,
        params,
        id: Some(Value::from(1)),
    };
    let str_call = serde_json::to_string(&call.to_json()).map_err(|e| e.to_string())?;

    let mut stream = UnixStream::connect(&addr)
        .map_err(|e| format!("Could not connect to {}: {}", addr, e))?;
    stream
        .write_all(str_call.as_bytes())
        .map_err(|e| format!("Could not send the command: {}", e))?;
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(|e| e.to_string())?;
    serde_json::from_reader(&mut stream).map_err(|e| format!("Invalid response: {}", e))
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args[0] == "--help" || args[0] == "-h" {
        println!("{}", USAGE);
        return;
    }
    match run(args) {
        Ok(response) => {
            match serde_json::to_string_pretty(&response) {
                Ok(pretty) => println!("{}", pretty),
                Err(_) => println!("{}", response),
            }
            if response.get("error").is_some() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    }
}
