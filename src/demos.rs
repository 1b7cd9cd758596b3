//! A minimal command set registered by the CLI binary: arithmetic, I/O,
//! and the async `msleep` demo. None of this is part of the library --
//! an embedder registers whatever commands its own host application
//! needs the same way.

use std::sync::Arc;
use std::time::Duration;

use pawscript::exec::{Context, HandlerResult};
use pawscript::host::Instance;
use pawscript::value::Value;

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => v.stringify().parse().unwrap_or(0.0),
    }
}

fn numeric(a: f64, b: f64) -> Value {
    if a.fract() == 0.0 && b.fract() == 0.0 {
        Value::Int(a as i64)
    } else {
        Value::Float(a)
    }
}

pub fn register(instance: &Instance) {
    instance.register_command(
        "echo",
        Arc::new(|ctx: &mut Context| {
            let text = ctx.args.iter().map(|v| ctx.stringify(v)).collect::<Vec<_>>().join(" ");
            println!("{text}");
            HandlerResult::Value(ctx.args.first().cloned().unwrap_or(Value::Null))
        }),
    );

    instance.register_command(
        "add",
        Arc::new(|ctx: &mut Context| {
            let sum: f64 = ctx.args.iter().map(as_f64).sum();
            HandlerResult::Value(numeric(sum, 0.0))
        }),
    );

    instance.register_command(
        "sub",
        Arc::new(|ctx: &mut Context| {
            let a = ctx.arg(0).map(as_f64).unwrap_or(0.0);
            let b = ctx.arg(1).map(as_f64).unwrap_or(0.0);
            HandlerResult::Value(numeric(a - b, 0.0))
        }),
    );

    instance.register_command(
        "lt",
        Arc::new(|ctx: &mut Context| {
            let a = ctx.arg(0).map(as_f64).unwrap_or(0.0);
            let b = ctx.arg(1).map(as_f64).unwrap_or(0.0);
            HandlerResult::Status(a < b)
        }),
    );

    // `msleep ms` -- requests a token, sleeps on a background thread,
    // then completes it; the executor blocks the caller until it does
    // (spec.md §4.4, §6.1).
    instance.register_command(
        "msleep",
        Arc::new(|ctx: &mut Context| {
            let ms = ctx.arg(0).map(as_f64).unwrap_or(0.0) as u64;
            let token = ctx.runtime.tokens.request_token(None, ctx.fiber_id);
            let tokens = ctx.runtime.tokens.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(ms));
                tokens.complete_and_signal(token, true, None);
            });
            HandlerResult::Token(token)
        }),
    );
}
