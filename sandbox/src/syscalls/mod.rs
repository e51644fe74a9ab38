//! Script-visible functions.
//!
//! Each function borrows the sandbox context out of the interpreter and
//! forwards to the embedder through the pipeline host trait, mapping host
//! failures onto script errors with the function name as prefix. Which
//! functions a script sees depends on the plugin type.

mod config;
mod inject;
mod message;
mod payload;

use mlua::Lua;

use crate::config::PluginType;

pub(crate) use payload::append_values;

/// Registers the script API for one plugin type.
///
/// The payload collector is registered under its internal name `output`;
/// after the script has loaded, the sandbox renames it to `add_to_payload`
/// and removes `output` from the global namespace.
pub(crate) fn install(lua: &Lua, plugin_type: PluginType) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set("read_config", config::read_config(lua)?)?;
    globals.set("decode_message", inject::decode_message(lua)?)?;
    if plugin_type.reads_messages() {
        globals.set("read_message", message::read_message(lua)?)?;
        globals.set("read_next_field", message::read_next_field(lua)?)?;
    }
    if plugin_type.writes_messages() {
        globals.set("write_message", message::write_message(lua)?)?;
    }
    if plugin_type.injects_messages() {
        globals.set("inject_message", inject::inject_message(lua)?)?;
    }
    if plugin_type.stages_payloads() {
        globals.set("inject_payload", inject::inject_payload(lua)?)?;
        globals.set("output", payload::output(lua)?)?;
    }
    Ok(())
}
