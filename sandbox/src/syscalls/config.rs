//! Plugin configuration lookup.

use mlua::{Function, Lua, Value};
use sluice_traits::ConfigValue;

use crate::context::ctx_mut;

pub(crate) fn read_config(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, name: String| {
        let ctx = ctx_mut(lua)?;
        match ctx.host.read_config(&name) {
            None => Ok(Value::Nil),
            Some(ConfigValue::String(s)) => Ok(Value::String(lua.create_string(&s)?)),
            Some(ConfigValue::Double(d)) => Ok(Value::Number(d)),
            Some(ConfigValue::Bool(b)) => Ok(Value::Boolean(b)),
        }
    })
}
