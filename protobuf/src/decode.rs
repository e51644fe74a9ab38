//! Wire message decoding back into a script table.
//!
//! The inverse of the encoder over the same fixed layout; unknown field ids
//! are skipped by wire type so newer pipeline revisions stay readable.

use byteorder::{ByteOrder, LittleEndian};
use mlua::{Lua, Table, Value};
use thiserror::Error;

use crate::{WIRE_FIXED64, WIRE_LEN, WIRE_VARINT};

/// Reasons a payload cannot be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload ended inside a value.
    #[error("unexpected end of message")]
    Truncated,
    /// A varint ran past ten bytes.
    #[error("varint overflow")]
    Varint,
    /// A field carried a wire type its id cannot have.
    #[error("unsupported wire type {0}")]
    WireType(u8),
    /// Building the result table failed.
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for shift in 0..10 {
            let byte = *self.data.get(self.pos).ok_or(DecodeError::Truncated)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::Varint)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        if end > self.data.len() {
            return Err(DecodeError::Truncated);
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn length_delimited(&mut self, wire: u8) -> Result<&'a [u8], DecodeError> {
        if wire != WIRE_LEN {
            return Err(DecodeError::WireType(wire));
        }
        let len = self.varint()? as usize;
        self.take(len)
    }

    fn integer(&mut self, wire: u8) -> Result<u64, DecodeError> {
        if wire != WIRE_VARINT {
            return Err(DecodeError::WireType(wire));
        }
        self.varint()
    }

    fn double(&mut self, wire: u8) -> Result<f64, DecodeError> {
        if wire != WIRE_FIXED64 {
            return Err(DecodeError::WireType(wire));
        }
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    fn skip(&mut self, wire: u8) -> Result<(), DecodeError> {
        match wire {
            WIRE_VARINT => {
                self.varint()?;
            }
            WIRE_FIXED64 => {
                self.take(8)?;
            }
            WIRE_LEN => {
                let len = self.varint()? as usize;
                self.take(len)?;
            }
            5 => {
                self.take(4)?;
            }
            other => return Err(DecodeError::WireType(other)),
        }
        Ok(())
    }
}

/// Decodes a wire message into a script table of the same shape the encoder
/// consumes: recognized headers by name plus a `Fields` array of
/// `{name, value, representation}` entries.
pub fn decode_message(lua: &Lua, data: &[u8]) -> Result<Table, DecodeError> {
    let msg = lua.create_table()?;
    let fields = lua.create_table()?;
    let mut field_count = 0i64;
    let mut reader = Reader::new(data);
    while !reader.done() {
        let tag = reader.varint()?;
        let id = tag >> 3;
        let wire = (tag & 7) as u8;
        match id {
            1 => msg.set("Uuid", lua.create_string(reader.length_delimited(wire)?)?)?,
            2 => msg.set("Timestamp", reader.integer(wire)? as i64)?,
            3 => msg.set("Type", lua.create_string(reader.length_delimited(wire)?)?)?,
            4 => msg.set("Logger", lua.create_string(reader.length_delimited(wire)?)?)?,
            5 => msg.set("Severity", reader.integer(wire)? as i64)?,
            6 => msg.set("Payload", lua.create_string(reader.length_delimited(wire)?)?)?,
            7 => msg.set(
                "EnvVersion",
                lua.create_string(reader.length_delimited(wire)?)?,
            )?,
            8 => msg.set("Pid", reader.integer(wire)? as i64)?,
            9 => msg.set("Hostname", lua.create_string(reader.length_delimited(wire)?)?)?,
            10 => {
                field_count += 1;
                let entry = decode_field(lua, reader.length_delimited(wire)?)?;
                fields.raw_set(field_count, entry)?;
            }
            _ => reader.skip(wire)?,
        }
    }
    if field_count > 0 {
        msg.set("Fields", fields)?;
    }
    Ok(msg)
}

fn decode_field(lua: &Lua, data: &[u8]) -> Result<Table, DecodeError> {
    let entry = lua.create_table()?;
    let mut strings: Vec<mlua::String> = Vec::new();
    let mut doubles: Vec<f64> = Vec::new();
    let mut bools: Vec<bool> = Vec::new();
    let mut reader = Reader::new(data);
    while !reader.done() {
        let tag = reader.varint()?;
        let id = tag >> 3;
        let wire = (tag & 7) as u8;
        match id {
            1 => entry.set("name", lua.create_string(reader.length_delimited(wire)?)?)?,
            2 => {
                // the value type is implied by which value fields appear
                reader.integer(wire)?;
            }
            3 => entry.set(
                "representation",
                lua.create_string(reader.length_delimited(wire)?)?,
            )?,
            4 => strings.push(lua.create_string(reader.length_delimited(wire)?)?),
            7 => doubles.push(reader.double(wire)?),
            8 => bools.push(reader.integer(wire)? != 0),
            _ => reader.skip(wire)?,
        }
    }
    let value = if !strings.is_empty() {
        collect_values(lua, strings)?
    } else if !doubles.is_empty() {
        collect_values(lua, doubles)?
    } else if !bools.is_empty() {
        collect_values(lua, bools)?
    } else {
        Value::Nil
    };
    entry.set("value", value)?;
    Ok(entry)
}

fn collect_values<T>(lua: &Lua, mut values: Vec<T>) -> Result<Value, DecodeError>
where
    T: mlua::IntoLua,
{
    if values.len() == 1 {
        if let Some(single) = values.pop() {
            return Ok(single.into_lua(lua)?);
        }
    }
    let array = lua.create_table()?;
    for (i, value) in values.into_iter().enumerate() {
        array.raw_set(i as i64 + 1, value)?;
    }
    Ok(Value::Table(array))
}
