//! Built-in target bundles.
//!
//! `builtin` is always loaded. Other bundles are opted into per worker via
//! the preload list.

use std::fmt::Write;
use std::time::Duration;

use serde_json::Value;

use crate::error::{BuckError, Result};
use crate::scheduler::job::{Args, Job};
use crate::worker::registry::{Execution, Registry, TargetError};

pub const BUILTIN: &str = "builtin";
pub const DIAGNOSTICS: &str = "diagnostics";

pub(crate) fn install(registry: &mut Registry, bundle: &str) -> Result<()> {
    match bundle {
        BUILTIN => install_builtin(registry),
        DIAGNOSTICS => install_diagnostics(registry),
        other => {
            return Err(BuckError::Worker(format!("unknown target bundle: {}", other)));
        }
    }
    Ok(())
}

pub(crate) fn install_builtin(registry: &mut Registry) {
    registry.register("strlen", strlen);
    registry.register("echo", echo);
    registry.register("sum", sum);
    registry.register("sleep", sleep);
    registry.register("fail", fail);
}

fn install_diagnostics(registry: &mut Registry) {
    registry.register("panic", |args: &Args, _: &mut Execution| {
        let message = string_arg(args, 0, "message").unwrap_or("requested panic");
        panic!("{}", message)
    });
    registry.register("abort", |_: &Args, _: &mut Execution| std::process::abort());
    registry.register("allocate", allocate);
    registry.register("spawn", spawn);
}

fn string_arg<'a>(args: &'a Args, index: usize, name: &str) -> Option<&'a str> {
    args.get(index, name).and_then(Value::as_str)
}

fn strlen(args: &Args, _: &mut Execution) -> std::result::Result<Value, TargetError> {
    let value = string_arg(args, 0, "value").ok_or("strlen expects a string argument")?;
    Ok(Value::from(value.len()))
}

fn echo(args: &Args, exec: &mut Execution) -> std::result::Result<Value, TargetError> {
    let value = args.to_value();
    write!(exec, "{}", value).map_err(|e| TargetError::new(e.to_string()))?;
    Ok(value)
}

fn sum(args: &Args, _: &mut Execution) -> std::result::Result<Value, TargetError> {
    let values = args.values();
    if values.iter().all(|v| v.is_i64()) {
        return Ok(Value::from(values.iter().filter_map(|v| v.as_i64()).sum::<i64>()));
    }
    let mut total = 0.0;
    for value in values {
        total += value
            .as_f64()
            .ok_or_else(|| TargetError::new(format!("sum expects numbers, got {}", value)))?;
    }
    Ok(Value::from(total))
}

fn sleep(args: &Args, _: &mut Execution) -> std::result::Result<Value, TargetError> {
    let seconds = args
        .get(0, "seconds")
        .and_then(Value::as_f64)
        .ok_or("sleep expects a number of seconds")?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(TargetError::new(format!("invalid sleep duration: {}", seconds)));
    }
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(Value::Null)
}

fn fail(args: &Args, _: &mut Execution) -> std::result::Result<Value, TargetError> {
    let message = string_arg(args, 0, "message").unwrap_or("requested failure");
    Err(TargetError::new(message))
}

fn allocate(args: &Args, _: &mut Execution) -> std::result::Result<Value, TargetError> {
    let bytes = args
        .get(0, "bytes")
        .and_then(Value::as_u64)
        .ok_or("allocate expects a byte count")? as usize;
    let mut buffer: Vec<u8> = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|e| TargetError::new(format!("memory limit exceeded: {}", e)))?;
    buffer.resize(bytes, 1);
    Ok(Value::from(buffer.len()))
}

/// Spawns one child job per remaining argument: `spawn(target, arg, arg, ...)`.
fn spawn(args: &Args, exec: &mut Execution) -> std::result::Result<Value, TargetError> {
    let target = string_arg(args, 0, "target").ok_or("spawn expects a target name")?;
    let rest: Vec<Value> = args.values().into_iter().skip(1).cloned().collect();
    let count = rest.len();
    for value in rest {
        exec.spawn(Job::call(target).arg(value));
    }
    Ok(Value::from(count))
}
