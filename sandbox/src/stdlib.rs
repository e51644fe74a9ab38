//! Standard-library surface offered to scripts.
//!
//! Only base, math, string, table and os are loaded, each stripped of the
//! functions that could reach the host process, plus the `circular_buffer`
//! module. Every sanctioned library table gets an empty marker metatable so
//! the state serializer can recognize and skip it while walking globals.

use mlua::{Lua, Table, Value};

/// Base functions removed from the global namespace.
const DISABLED_BASE: &[&str] = &[
    "collectgarbage",
    "coroutine",
    "dofile",
    "getfenv",
    "getmetatable",
    "load",
    "loadfile",
    "loadstring",
    "module",
    "print",
    "rawequal",
    "rawget",
    "rawset",
    "require",
    "setfenv",
];

/// Functions removed from the os table.
const DISABLED_OS: &[&str] = &[
    "execute",
    "exit",
    "remove",
    "rename",
    "setlocale",
    "tmpname",
];

/// Libraries kept in the sandbox and resolvable through `require`.
const SANCTIONED: &[&str] = &["math", "string", "table", "os"];

pub(crate) fn install(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in DISABLED_BASE {
        globals.set(*name, Value::Nil)?;
    }
    let os: Table = globals.get("os")?;
    for name in DISABLED_OS {
        os.set(*name, Value::Nil)?;
    }
    for name in SANCTIONED {
        let library: Table = globals.get(*name)?;
        library.set_metatable(Some(lua.create_table()?));
    }

    let ring = sluice_circular_buffer::install(lua)?;
    ring.set_metatable(Some(lua.create_table()?));
    globals.set("circular_buffer", ring)?;

    // host-controlled require: only modules the sandbox itself provides
    let require = lua.create_function(|lua, name: String| {
        if name == "circular_buffer" || SANCTIONED.contains(&name.as_str()) {
            lua.globals().get::<Table>(name.as_str())
        } else {
            Err(mlua::Error::RuntimeError(format!(
                "library '{name}' is not available"
            )))
        }
    })?;
    globals.set("require", require)?;
    Ok(())
}
