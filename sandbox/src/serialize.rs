//! State serialization.
//!
//! Two walkers live here. The preservation walker turns the script's user
//! globals into a Lua program that rebuilds them when executed in a fresh
//! sandbox: scalars become assignments, tables are registered by pointer so
//! shared and cyclic structure collapses into aliases of the first site, and
//! circular buffers delegate to their own restoration-script emitter. The
//! JSON walker backs `output(table)`; it skips underscore-prefixed keys and
//! refuses to revisit any pointer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use mlua::{Function, Lua, Table, Value};
use sluice_circular_buffer::CircularBuffer;
use sluice_output_buffer::{format_f64, OutputBuffer, OutputError};
use thiserror::Error;

/// Failures while preserving global data.
#[derive(Debug, Error)]
pub(crate) enum PreserveError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("cannot preserve type '{0}'")]
    Unsupported(String),
    #[error("cannot access the string format function")]
    QuoteUnavailable,
    #[error(transparent)]
    Lua(#[from] mlua::Error),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Ring(#[from] sluice_circular_buffer::RingError),
}

struct PreserveState {
    /// Pointer of every table or buffer already written, with the key path
    /// of its first occurrence.
    seen: Vec<(usize, Vec<u8>)>,
    globals_ptr: usize,
}

impl PreserveState {
    fn first_site(&self, ptr: usize) -> Option<Vec<u8>> {
        self.seen
            .iter()
            .find(|(seen, _)| *seen == ptr)
            .map(|(_, path)| path.clone())
    }
}

/// Writes the restoration program for the sandbox's user globals to `path`.
///
/// The caller removes the partial file on failure. `scratch` is the
/// sandbox's shared output buffer, borrowed for circular-buffer fragments.
pub(crate) fn preserve_globals(
    lua: &Lua,
    path: &Path,
    scratch: &mut OutputBuffer,
) -> Result<(), PreserveError> {
    let globals = lua.globals();
    let quote = quote_fn(lua)?;
    let mut writer = BufWriter::new(File::create(path)?);
    let mut state = PreserveState {
        seen: Vec::new(),
        globals_ptr: globals.to_pointer() as usize,
    };
    for pair in globals.pairs::<Value, Value>() {
        let (key, value) = pair?;
        write_kvp(&mut writer, &mut state, b"_G", &key, &value, &quote, scratch)?;
    }
    writer.flush()?;
    Ok(())
}

/// The interpreter's own lossless string quoting (`string.format("%q", ...)`).
fn quote_fn(lua: &Lua) -> Result<Function, PreserveError> {
    let string: Table = lua
        .globals()
        .get::<Option<Table>>("string")?
        .ok_or(PreserveError::QuoteUnavailable)?;
    string
        .get::<Option<Function>>("format")?
        .ok_or(PreserveError::QuoteUnavailable)
}

/// Renders a scalar as a Lua literal.
fn literal(quote: &Function, value: &Value) -> Result<Vec<u8>, PreserveError> {
    match value {
        Value::Integer(i) => Ok(i.to_string().into_bytes()),
        Value::Number(n) => Ok(format_f64(*n).into_bytes()),
        Value::Boolean(true) => Ok(b"true".to_vec()),
        Value::Boolean(false) => Ok(b"false".to_vec()),
        Value::String(_) => {
            let quoted: mlua::String = quote.call(("%q", value.clone()))?;
            Ok(quoted.as_bytes().to_vec())
        }
        other => Err(PreserveError::Unsupported(other.type_name().to_string())),
    }
}

/// Values the preservation walker does not follow: sanctioned library
/// tables (marker metatable), the globals table itself, functions, threads,
/// and userdata of unknown types.
fn ignore_value(state: &PreserveState, value: &Value) -> bool {
    match value {
        Value::Table(t) => {
            t.metatable().is_some() || t.to_pointer() as usize == state.globals_ptr
        }
        Value::UserData(ud) => ud.borrow::<CircularBuffer>().is_err(),
        Value::Integer(_) | Value::Number(_) | Value::String(_) | Value::Boolean(_) => false,
        _ => true,
    }
}

fn write_kvp<W: Write>(
    writer: &mut W,
    state: &mut PreserveState,
    parent: &[u8],
    key: &Value,
    value: &Value,
    quote: &Function,
    scratch: &mut OutputBuffer,
) -> Result<(), PreserveError> {
    if ignore_value(state, value) {
        return Ok(());
    }
    let key_literal = literal(quote, key)?;
    let mut path = Vec::with_capacity(parent.len() + key_literal.len() + 2);
    path.extend_from_slice(parent);
    path.push(b'[');
    path.extend_from_slice(&key_literal);
    path.push(b']');

    match value {
        Value::Table(table) => {
            let ptr = table.to_pointer() as usize;
            if let Some(first) = state.first_site(ptr) {
                write_alias(writer, &path, &first)?;
            } else {
                state.seen.push((ptr, path.clone()));
                writer.write_all(&path)?;
                writer.write_all(b" = {}\n")?;
                for pair in table.clone().pairs::<Value, Value>() {
                    let (key, value) = pair?;
                    write_kvp(writer, state, &path, &key, &value, quote, scratch)?;
                }
            }
        }
        Value::UserData(ud) => {
            let ptr = ud.to_pointer() as usize;
            if let Some(first) = state.first_site(ptr) {
                write_alias(writer, &path, &first)?;
            } else {
                state.seen.push((ptr, path.clone()));
                let ring = ud.borrow::<CircularBuffer>()?;
                scratch.clear();
                ring.write_restore_script(&path, scratch)?;
                writer.write_all(scratch.as_bytes())?;
                scratch.clear();
            }
        }
        _ => {
            let value_literal = literal(quote, value)?;
            writer.write_all(&path)?;
            writer.write_all(b" = ")?;
            writer.write_all(&value_literal)?;
            writer.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn write_alias<W: Write>(writer: &mut W, path: &[u8], first: &[u8]) -> std::io::Result<()> {
    writer.write_all(path)?;
    writer.write_all(b" = ")?;
    writer.write_all(first)?;
    writer.write_all(b"\n")
}

/// Failures while emitting a table as JSON.
#[derive(Debug, Error)]
pub(crate) enum JsonError {
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("table contains an internal or circular reference")]
    Cycle,
    #[error("json serialization cannot preserve type '{0}'")]
    Unsupported(String),
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Maps a JSON failure onto the script-visible error.
pub(crate) fn json_script_err(err: JsonError) -> mlua::Error {
    match err {
        JsonError::Output(_) => mlua::Error::RuntimeError("output_limit exceeded".to_string()),
        JsonError::Lua(e) => e,
        other => mlua::Error::RuntimeError(other.to_string()),
    }
}

/// Emits `{"<_name|table>": <json>}\n` for a script table into the shared
/// output buffer.
pub(crate) fn write_table_json(table: &Table, out: &mut OutputBuffer) -> Result<(), JsonError> {
    out.push_byte(b'{')?;
    let name = match table.raw_get::<Value>("_name")? {
        Value::String(s) => s.as_bytes().to_vec(),
        _ => b"table".to_vec(),
    };
    write_json_string(out, &name)?;
    out.push_byte(b':')?;
    let mut seen = Vec::new();
    write_json_value(&Value::Table(table.clone()), out, &mut seen)?;
    out.push_str("}\n")?;
    Ok(())
}

/// Leaf values the JSON walker silently drops from hashes and arrays.
fn json_skippable(value: &Value) -> bool {
    match value {
        Value::Table(t) => t.metatable().is_some(),
        Value::Integer(_) | Value::Number(_) | Value::String(_) | Value::Boolean(_) => false,
        _ => true,
    }
}

fn write_json_value(
    value: &Value,
    out: &mut OutputBuffer,
    seen: &mut Vec<usize>,
) -> Result<(), JsonError> {
    match value {
        Value::Integer(i) => out.push_str(&i.to_string())?,
        Value::Number(n) => out.push_f64(*n)?,
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" })?,
        Value::String(s) => write_json_string(out, &s.as_bytes())?,
        Value::Table(table) => {
            let ptr = table.to_pointer() as usize;
            if seen.contains(&ptr) {
                return Err(JsonError::Cycle);
            }
            seen.push(ptr);
            let is_hash = matches!(table.raw_get::<Value>(1)?, Value::Nil);
            if is_hash {
                out.push_byte(b'{')?;
                let mut first = true;
                for pair in table.clone().pairs::<Value, Value>() {
                    let (key, value) = pair?;
                    if json_skippable(&value) {
                        continue;
                    }
                    // only plain string keys survive; numeric and
                    // underscore-prefixed keys are dropped
                    let key = match &key {
                        Value::String(s) if s.as_bytes().first() != Some(&b'_') => s.clone(),
                        _ => continue,
                    };
                    if !first {
                        out.push_byte(b',')?;
                    }
                    first = false;
                    write_json_string(out, &key.as_bytes())?;
                    out.push_byte(b':')?;
                    write_json_value(&value, out, seen)?;
                }
                out.push_byte(b'}')?;
            } else {
                out.push_byte(b'[')?;
                let mut first = true;
                for element in table.clone().sequence_values::<Value>() {
                    let element = element?;
                    if json_skippable(&element) {
                        continue;
                    }
                    if !first {
                        out.push_byte(b',')?;
                    }
                    first = false;
                    write_json_value(&element, out, seen)?;
                }
                out.push_byte(b']')?;
            }
        }
        other => return Err(JsonError::Unsupported(other.type_name().to_string())),
    }
    Ok(())
}

fn write_json_string(out: &mut OutputBuffer, bytes: &[u8]) -> Result<(), JsonError> {
    out.push_byte(b'"')?;
    for &byte in bytes {
        match byte {
            b'"' => out.push_str("\\\"")?,
            b'\\' => out.push_str("\\\\")?,
            b'/' => out.push_str("\\/")?,
            0x08 => out.push_str("\\b")?,
            0x0c => out.push_str("\\f")?,
            b'\n' => out.push_str("\\n")?,
            b'\r' => out.push_str("\\r")?,
            b'\t' => out.push_str("\\t")?,
            other => out.push_byte(other)?,
        }
    }
    out.push_byte(b'"')?;
    Ok(())
}
