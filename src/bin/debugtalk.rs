//! Demo plugin: registers a handful of functions and serves them to a
//! bridge host.

use std::time::Duration;

use plugin_bridge::logging;
use plugin_bridge::{serve, FunctionError, FunctionRegistry, Value};

fn int_arg(args: &[Value], index: usize) -> Result<i64, FunctionError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| FunctionError(format!("argument {index} must be an int")))
}

fn str_arg(args: &[Value], index: usize) -> Result<&str, FunctionError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| FunctionError(format!("argument {index} must be a string")))
}

fn sum_ints(args: Vec<Value>) -> Result<Value, FunctionError> {
    let mut total: i64 = 0;
    for index in 0..args.len() {
        total = total
            .checked_add(int_arg(&args, index)?)
            .ok_or_else(|| FunctionError::from("integer overflow"))?;
    }
    Ok(Value::Int(total))
}

fn sum_two_int(args: Vec<Value>) -> Result<Value, FunctionError> {
    if args.len() != 2 {
        return Err(format!("expected 2 arguments, got {}", args.len()).into());
    }
    Ok(Value::Int(int_arg(&args, 0)? + int_arg(&args, 1)?))
}

/// Ints stay ints; any float argument makes the result a float.
fn sum(args: Vec<Value>) -> Result<Value, FunctionError> {
    let mut any_float = false;
    let mut total = 0.0;
    for arg in &args {
        match arg {
            Value::Int(i) => total += *i as f64,
            Value::Float(f) => {
                any_float = true;
                total += f;
            }
            other => return Err(format!("cannot sum a {}", other.kind()).into()),
        }
    }

    if any_float {
        Ok(Value::Float(total))
    } else {
        args.iter()
            .filter_map(Value::as_i64)
            .try_fold(0i64, i64::checked_add)
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".into())
    }
}

fn sum_two_string(args: Vec<Value>) -> Result<Value, FunctionError> {
    if args.len() != 2 {
        return Err(format!("expected 2 arguments, got {}", args.len()).into());
    }
    Ok(Value::String(format!("{}{}", str_arg(&args, 0)?, str_arg(&args, 1)?)))
}

fn sum_strings(args: Vec<Value>) -> Result<Value, FunctionError> {
    let mut joined = String::new();
    for index in 0..args.len() {
        joined.push_str(str_arg(&args, index)?);
    }
    Ok(Value::String(joined))
}

fn concatenate(args: Vec<Value>) -> Result<Value, FunctionError> {
    Ok(Value::String(args.iter().map(Value::to_string).collect()))
}

fn setup_hook_example(args: Vec<Value>) -> Result<Value, FunctionError> {
    Ok(Value::String(format!("step name: {}, setup...", str_arg(&args, 0)?)))
}

fn teardown_hook_example(args: Vec<Value>) -> Result<Value, FunctionError> {
    Ok(Value::String(format!("step name: {}, teardown...", str_arg(&args, 0)?)))
}

/// Sleep for the given number of milliseconds, then return it.
fn sleep_ms(args: Vec<Value>) -> Result<Value, FunctionError> {
    let ms = int_arg(&args, 0)?;
    let ms = u64::try_from(ms).map_err(|_| FunctionError::from("duration must not be negative"))?;
    std::thread::sleep(Duration::from_millis(ms));
    Ok(Value::Int(ms as i64))
}

#[tokio::main]
async fn main() {
    logging::init_plugin_tracing();

    let mut registry = FunctionRegistry::new();
    registry
        .register("sum_ints", sum_ints)
        .register("sum_two_int", sum_two_int)
        .register("sum", sum)
        .register("sum_two_string", sum_two_string)
        .register("sum_strings", sum_strings)
        .register("concatenate", concatenate)
        .register("setup_hook_example", setup_hook_example)
        .register("teardown_hook_example", teardown_hook_example)
        .register("sleep_ms", sleep_ms);

    if let Err(e) = serve(registry).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
