//! Message field access.

use mlua::{Function, Lua, Value};
use sluice_traits::{FieldValue, WriteValue};

use crate::context::ctx_mut;

fn check_index(value: Option<i64>, what: &str, func: &str) -> mlua::Result<usize> {
    let index = value.unwrap_or(0);
    if index < 0 {
        return Err(mlua::Error::RuntimeError(format!(
            "{func}() {what} must be >= 0"
        )));
    }
    Ok(index as usize)
}

fn field_to_lua(lua: &Lua, value: FieldValue) -> mlua::Result<Value> {
    Ok(match value {
        FieldValue::Bytes(bytes) => Value::String(lua.create_string(&bytes)?),
        FieldValue::Int(i) => Value::Integer(i),
        FieldValue::Double(d) => Value::Number(d),
        FieldValue::Bool(b) => Value::Boolean(b),
    })
}

pub(crate) fn read_message(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(
        |lua, (field, field_index, array_index): (String, Option<i64>, Option<i64>)| {
            let field_index = check_index(field_index, "field index", "read_message")?;
            let array_index = check_index(array_index, "array index", "read_message")?;
            let ctx = ctx_mut(lua)?;
            match ctx.host.read_message(&field, field_index, array_index) {
                None => Ok(Value::Nil),
                Some(value) => field_to_lua(lua, value),
            }
        },
    )
}

pub(crate) fn read_next_field(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, ()| {
        let mut ctx = ctx_mut(lua)?;
        match ctx.host.read_next_field() {
            None => Ok((Value::Nil, Value::Nil, Value::Nil, Value::Nil, Value::Nil)),
            Some(field) => {
                let type_code = match &field.value {
                    FieldValue::Bytes(_) => 0,
                    FieldValue::Int(_) => 2,
                    FieldValue::Double(_) => 3,
                    FieldValue::Bool(_) => 4,
                };
                Ok((
                    Value::Integer(type_code),
                    Value::String(lua.create_string(&field.name)?),
                    field_to_lua(lua, field.value)?,
                    Value::String(lua.create_string(&field.representation)?),
                    Value::Integer(field.count as i64),
                ))
            }
        }
    })
}

pub(crate) fn write_message(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(
        |lua,
         (field, value, representation, field_index, array_index): (
            String,
            Value,
            Option<String>,
            Option<i64>,
            Option<i64>,
        )| {
            let has_array_index = array_index.is_some();
            let field_index = check_index(field_index, "field index", "write_message")?;
            let array_index = check_index(array_index, "array index", "write_message")?;
            let representation = representation.unwrap_or_default();
            let mut ctx = ctx_mut(lua)?;
            let result = match &value {
                Value::String(s) => {
                    let text = s.to_str()?;
                    ctx.host.write_message(
                        &field,
                        WriteValue::Str(&text),
                        &representation,
                        field_index,
                        array_index,
                        has_array_index,
                    )
                }
                Value::Integer(i) => ctx.host.write_message(
                    &field,
                    WriteValue::Double(*i as f64),
                    &representation,
                    field_index,
                    array_index,
                    has_array_index,
                ),
                Value::Number(n) => ctx.host.write_message(
                    &field,
                    WriteValue::Double(*n),
                    &representation,
                    field_index,
                    array_index,
                    has_array_index,
                ),
                Value::Boolean(b) => ctx.host.write_message(
                    &field,
                    WriteValue::Bool(*b),
                    &representation,
                    field_index,
                    array_index,
                    has_array_index,
                ),
                Value::Nil => ctx.host.write_message(
                    &field,
                    WriteValue::Nil,
                    &representation,
                    field_index,
                    array_index,
                    has_array_index,
                ),
                _ => {
                    return Err(mlua::Error::RuntimeError(
                        "write_message() only accepts numeric, string, boolean, or nil field values"
                            .to_string(),
                    ))
                }
            };
            result.map_err(|e| mlua::Error::RuntimeError(format!("write_message() {e}")))
        },
    )
}
