//! Payload staging.
//!
//! `output(...)` — renamed `add_to_payload` after init — appends a variadic
//! mix of scalars, tables (as JSON) and circular buffers (in their selected
//! format) to the shared output buffer, then enforces the output quota.

use mlua::{Function, Lua, Value, Variadic};
use sluice_circular_buffer::{CircularBuffer, RingError};
use sluice_output_buffer::OutputError;

use crate::context::{ctx_mut, RuntimeContext};
use crate::serialize;

fn overflow_err(_: OutputError) -> mlua::Error {
    mlua::Error::RuntimeError("output_limit exceeded".to_string())
}

fn ring_script_err(err: RingError) -> mlua::Error {
    match err {
        RingError::Output(_) => overflow_err(OutputError::Overflow),
        other => mlua::Error::RuntimeError(other.to_string()),
    }
}

/// Appends the given values to the output buffer and checks the quota.
pub(crate) fn append_values(ctx: &mut RuntimeContext, values: &[Value]) -> mlua::Result<()> {
    for value in values {
        match value {
            Value::Integer(i) => ctx.output.push_str(&i.to_string()).map_err(overflow_err)?,
            Value::Number(n) => ctx.output.push_f64(*n).map_err(overflow_err)?,
            Value::String(s) => ctx.output.push_bytes(&s.as_bytes()).map_err(overflow_err)?,
            Value::Boolean(b) => ctx
                .output
                .push_str(if *b { "true" } else { "false" })
                .map_err(overflow_err)?,
            Value::Nil => ctx.output.push_str("nil").map_err(overflow_err)?,
            Value::Table(t) => serialize::write_table_json(t, &mut ctx.output)
                .map_err(serialize::json_script_err)?,
            Value::UserData(ud) => {
                if let Ok(mut ring) = ud.borrow_mut::<CircularBuffer>() {
                    ring.write(&mut ctx.output).map_err(ring_script_err)?;
                }
                // unknown userdata is ignored, as are functions and threads
            }
            _ => {}
        }
    }
    ctx.check_output_quota()
}

pub(crate) fn output(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, args: Variadic<Value>| {
        if args.is_empty() {
            return Err(mlua::Error::RuntimeError(
                "output() must have at least one argument".to_string(),
            ));
        }
        let mut ctx = ctx_mut(lua)?;
        append_values(&mut ctx, &args)
    })
}
