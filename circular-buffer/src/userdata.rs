//! Script-facing surface of the circular buffer.
//!
//! Scripts see a `circular_buffer` module with a single `new` constructor and
//! method calls on the returned userdata. Column indexes are 1-based on this
//! side of the boundary.

use mlua::{Lua, Table, UserData, UserDataMethods};

use crate::{CircularBuffer, ComputeFn, RingError};

fn ring_err(err: RingError) -> mlua::Error {
    mlua::Error::RuntimeError(err.to_string())
}

fn check_column(columns: usize, column: i64) -> mlua::Result<usize> {
    if column < 1 || column as usize > columns {
        return Err(ring_err(RingError::ColumnRange));
    }
    Ok(column as usize - 1)
}

impl UserData for CircularBuffer {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("add", |_, this, (ns, column, value): (f64, i64, f64)| {
            let column = check_column(this.columns(), column)?;
            Ok(this.add(ns, column, value))
        });

        methods.add_method_mut("set", |_, this, (ns, column, value): (f64, i64, f64)| {
            let column = check_column(this.columns(), column)?;
            Ok(this.set(ns, column, value))
        });

        methods.add_method("get", |_, this, (ns, column): (f64, i64)| {
            let column = check_column(this.columns(), column)?;
            Ok(this.get(ns, column))
        });

        methods.add_method_mut(
            "set_header",
            |_,
             this,
             (column, name, unit, aggregation): (
                i64,
                String,
                Option<String>,
                Option<String>,
            )| {
                let column = check_column(this.columns(), column)?;
                this.set_header(column, &name, unit.as_deref(), aggregation.as_deref())
                    .map(|c| c as i64 + 1)
                    .map_err(ring_err)
            },
        );

        methods.add_method(
            "compute",
            |_, this, (func, column, start_ns, end_ns): (String, i64, Option<f64>, Option<f64>)| {
                let func: ComputeFn = func.parse().map_err(ring_err)?;
                let column = check_column(this.columns(), column)?;
                Ok(this.compute(func, column, start_ns, end_ns))
            },
        );

        methods.add_method_mut("format", |_, this, format: String| {
            this.set_format(&format).map_err(ring_err)
        });

        methods.add_method_mut("fromstring", |_, this, payload: String| {
            this.from_string(&payload).map_err(ring_err)
        });
    }
}

/// Builds the `circular_buffer` module table for a sandbox.
pub fn install(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "new",
        lua.create_function(
            |_, (rows, columns, seconds_per_row, delta): (i64, i64, i64, Option<bool>)| {
                CircularBuffer::new(rows, columns, seconds_per_row, delta.unwrap_or(false))
                    .map_err(ring_err)
            },
        )?,
    )?;
    Ok(module)
}
