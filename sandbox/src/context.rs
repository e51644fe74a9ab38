//! Shared per-sandbox state reachable from script-visible functions.
//!
//! The interpreter's application data slot holds one [`RuntimeContext`]: the
//! embedder handle, the shared output buffer and the output quota counters.
//! Every registered function borrows it for the duration of one call.

use mlua::{AppDataRefMut, Lua};
use sluice_output_buffer::OutputBuffer;
use sluice_traits::PipelineHost;

pub(crate) struct RuntimeContext {
    pub(crate) host: Box<dyn PipelineHost>,
    pub(crate) output: OutputBuffer,
    pub(crate) output_limit: u64,
    pub(crate) output_current: u64,
    pub(crate) output_maximum: u64,
}

impl RuntimeContext {
    pub(crate) fn new(host: Box<dyn PipelineHost>, output_limit: u64) -> Self {
        RuntimeContext {
            host,
            output: OutputBuffer::new(),
            output_limit,
            output_current: 0,
            output_maximum: 0,
        }
    }

    pub(crate) fn update_output_stats(&mut self) {
        self.output_current = self.output.len() as u64;
        if self.output_current > self.output_maximum {
            self.output_maximum = self.output_current;
        }
    }

    /// Measures the buffer and raises the script-visible quota error when it
    /// has outgrown the configured limit.
    pub(crate) fn check_output_quota(&mut self) -> mlua::Result<()> {
        self.update_output_stats();
        if self.output_current > self.output_limit {
            return Err(mlua::Error::RuntimeError(
                "output_limit exceeded".to_string(),
            ));
        }
        Ok(())
    }
}

/// Borrows the sandbox context out of the interpreter.
pub(crate) fn ctx_mut(lua: &Lua) -> mlua::Result<AppDataRefMut<RuntimeContext>> {
    lua.app_data_mut::<RuntimeContext>()
        .ok_or_else(|| mlua::Error::RuntimeError("sandbox context missing".to_string()))
}
