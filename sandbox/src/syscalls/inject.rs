//! Message injection and decoding.

use mlua::{Function, Lua, Table, Value, Variadic};

use crate::context::ctx_mut;
use crate::syscalls::append_values;

/// `inject_message(table)` — encodes the table as a wire message and hands
/// it to the pipeline. The output buffer is reset once the host has
/// consumed it.
pub(crate) fn inject_message(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, msg: Table| {
        let mut ctx = ctx_mut(lua)?;
        let ctx = &mut *ctx;
        sluice_protobuf::encode_message(&msg, &mut ctx.output).map_err(|e| {
            mlua::Error::RuntimeError(format!("inject_message() could not encode protobuf - {e}"))
        })?;
        if !ctx.output.is_empty() {
            ctx.check_output_quota()?;
            let result = ctx.host.inject_message(ctx.output.as_bytes(), "", "");
            ctx.output.clear();
            result.map_err(|e| mlua::Error::RuntimeError(format!("inject_message() {e}")))?;
        }
        Ok(())
    })
}

/// `inject_payload(type?, name?, ...)` — appends any extra arguments to the
/// staged payload, then hands the whole buffer to the pipeline qualified by
/// `type` (default `"txt"`) and `name`.
pub(crate) fn inject_payload(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, args: Variadic<Value>| {
        let msg_type = match args.first() {
            None => "txt".to_string(),
            Some(Value::String(s)) => {
                let text = s.to_str()?.to_string();
                if text.is_empty() {
                    "txt".to_string()
                } else {
                    text
                }
            }
            Some(_) => {
                return Err(mlua::Error::RuntimeError(
                    "inject_payload() type must be a string".to_string(),
                ))
            }
        };
        let name = match args.get(1) {
            None => String::new(),
            Some(Value::String(s)) => s.to_str()?.to_string(),
            Some(_) => {
                return Err(mlua::Error::RuntimeError(
                    "inject_payload() name must be a string".to_string(),
                ))
            }
        };
        let mut ctx = ctx_mut(lua)?;
        let ctx = &mut *ctx;
        if args.len() > 2 {
            append_values(ctx, &args[2..])?;
        }
        if !ctx.output.is_empty() {
            ctx.check_output_quota()?;
            let result = ctx.host.inject_message(ctx.output.as_bytes(), &msg_type, &name);
            ctx.output.clear();
            result.map_err(|e| mlua::Error::RuntimeError(format!("inject_payload() {e}")))?;
        }
        Ok(())
    })
}

/// `decode_message(bytes)` — parses a wire message back into a script table.
pub(crate) fn decode_message(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, payload: mlua::String| {
        sluice_protobuf::decode_message(lua, &payload.as_bytes())
            .map_err(|e| mlua::Error::RuntimeError(format!("decode_message() {e}")))
    })
}
