//! Sandbox lifecycle, quotas and dispatch.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use mlua::{Function, HookTriggers, Lua, LuaOptions, StdLib, Value, VmState};
use sluice_error::Error;
use sluice_output_buffer::OutputBuffer;
use sluice_traits::PipelineHost;

use crate::config::{PluginType, SandboxConfig};
use crate::context::RuntimeContext;
use crate::error::SandboxError;
use crate::serialize;
use crate::stdlib;
use crate::syscalls;
use crate::usage::{Status, UsageStat, UsageTracker, UsageType};

/// Ceiling for the interpreter heap quota, in bytes.
pub const MAX_MEMORY: u64 = 8 * 1024 * 1024;
/// Ceiling for the per-dispatch instruction quota.
pub const MAX_INSTRUCTIONS: u64 = 1_000_000;
/// Ceiling for the output buffer quota, in bytes.
pub const MAX_OUTPUT: u64 = sluice_output_buffer::MAX_OUTPUT as u64;

const MAX_ERROR_LEN: usize = 255;

/// One sandboxed plugin script.
///
/// A sandbox is single-owner and one-shot: once it reaches
/// [`Status::Terminated`] every dispatch is rejected and only
/// [`destroy`](Self::destroy) remains useful.
pub struct Sandbox {
    lua: Option<Lua>,
    /// Held between `create` and `init`, then moved into the interpreter.
    host: Option<Box<dyn PipelineHost>>,
    script_path: PathBuf,
    plugin_type: PluginType,
    status: Status,
    usage: UsageTracker,
    error_message: String,
    instruction_count: Arc<AtomicU64>,
    stopping: Arc<AtomicBool>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("script_path", &self.script_path)
            .field("plugin_type", &self.plugin_type)
            .field("status", &self.status)
            .field("usage", &self.usage)
            .field("error_message", &self.error_message)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Validates the limits against their ceilings and assembles an
    /// uninitialized sandbox.
    pub fn create(
        host: Box<dyn PipelineHost>,
        script_path: impl Into<PathBuf>,
        plugin_type: PluginType,
        memory_limit: u64,
        instruction_limit: u64,
        output_limit: u64,
    ) -> Result<Self, Error> {
        if memory_limit > MAX_MEMORY {
            return Err(SandboxError::LimitCeiling("memory").into());
        }
        if instruction_limit > MAX_INSTRUCTIONS {
            return Err(SandboxError::LimitCeiling("instruction").into());
        }
        if output_limit > MAX_OUTPUT {
            return Err(SandboxError::LimitCeiling("output").into());
        }
        Ok(Sandbox {
            lua: None,
            host: Some(host),
            script_path: script_path.into(),
            plugin_type,
            status: Status::Unknown,
            usage: UsageTracker::new(memory_limit, instruction_limit, output_limit),
            error_message: String::new(),
            instruction_count: Arc::new(AtomicU64::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// [`create`](Self::create) from a parsed configuration.
    pub fn from_config(host: Box<dyn PipelineHost>, config: &SandboxConfig) -> Result<Self, Error> {
        Self::create(
            host,
            config.script_path.clone(),
            config.plugin_type,
            config.memory_limit,
            config.instruction_limit,
            config.output_limit,
        )
    }

    /// Stands up the interpreter, loads the script, and optionally restores
    /// preserved global state from `state_path`.
    ///
    /// Failure leaves the sandbox [`Status::Terminated`] with the reason in
    /// [`last_error`](Self::last_error).
    pub fn init(&mut self, state_path: Option<&Path>) -> Result<(), Error> {
        if self.lua.is_some() {
            return Ok(());
        }
        let host = match self.host.take() {
            Some(host) => host,
            None => return Err(SandboxError::NotRunning.into()),
        };
        match self.run_init(host, state_path) {
            Ok(()) => {
                self.status = Status::Running;
                debug!(
                    "sandbox running: {} ({} bytes in use)",
                    self.script_path.display(),
                    self.usage.get(UsageType::Memory, UsageStat::Current)
                );
                Ok(())
            }
            Err(error) => {
                self.terminate(&format!("init() {error}"));
                Err(error.into())
            }
        }
    }

    fn run_init(
        &mut self,
        host: Box<dyn PipelineHost>,
        state_path: Option<&Path>,
    ) -> Result<(), SandboxError> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::OS,
            LuaOptions::default(),
        )?;
        lua.set_memory_limit(self.usage.get(UsageType::Memory, UsageStat::Limit) as usize)?;
        stdlib::install(&lua)?;
        lua.set_app_data(RuntimeContext::new(
            host,
            self.usage.get(UsageType::Output, UsageStat::Limit),
        ));
        syscalls::install(&lua, self.plugin_type)?;

        let source = fs::read_to_string(&self.script_path).map_err(|e| {
            SandboxError::BadScript(format!(
                "could not load '{}': {e}",
                self.script_path.display()
            ))
        })?;
        self.arm_hook(&lua);
        let chunk_name = self.script_path.display().to_string();
        lua.load(source.as_str())
            .set_name(chunk_name)
            .exec()
            .map_err(|e| SandboxError::Script(error_text(&e)))?;
        lua.remove_hook();
        self.usage.record(
            UsageType::Instructions,
            self.instruction_count.load(Ordering::Relaxed),
        );

        if let Some(path) = state_path {
            if path.exists() {
                self.restore(&lua, path)?;
            }
        }

        // hand `output` to the script under its public name
        let globals = lua.globals();
        if self.plugin_type.stages_payloads() {
            let output: Value = globals.get("output")?;
            globals.set("add_to_payload", output)?;
        }
        globals.set("output", Value::Nil)?;

        lua.gc_collect()?;
        self.usage
            .record(UsageType::Memory, lua.used_memory() as u64);
        self.lua = Some(lua);
        Ok(())
    }

    /// Executes a preserved state file with the memory ceiling raised and
    /// the instruction hook removed, then settles the accounting.
    fn restore(&mut self, lua: &Lua, path: &Path) -> Result<(), SandboxError> {
        lua.set_memory_limit((2 * MAX_MEMORY) as usize)?;
        lua.remove_hook();
        let state = fs::read(path).map_err(|e| {
            SandboxError::Restore(format!(
                "restore_global_data could not read '{}': {e}",
                path.display()
            ))
        })?;
        lua.load(state.as_slice())
            .set_name("=preserved state")
            .exec()
            .map_err(|e| SandboxError::Restore(format!("restore_global_data {}", error_text(&e))))?;
        lua.gc_collect()?;
        lua.set_memory_limit(self.usage.get(UsageType::Memory, UsageStat::Limit) as usize)?;
        let current = lua.used_memory() as u64;
        self.usage.set(UsageType::Memory, UsageStat::Current, current);
        self.usage.set(UsageType::Memory, UsageStat::Maximum, current);
        debug!("restored state from {}", path.display());
        Ok(())
    }

    /// Arms the per-instruction hook for one dispatch: counts into the usage
    /// matrix, raises the quota error at the limit, and turns into an
    /// immediate abort once [`stop`](Self::stop) has been requested.
    fn arm_hook(&self, lua: &Lua) {
        self.instruction_count.store(0, Ordering::Relaxed);
        let counter = Arc::clone(&self.instruction_count);
        let stopping = Arc::clone(&self.stopping);
        let limit = self.usage.get(UsageType::Instructions, UsageStat::Limit);
        lua.set_hook(HookTriggers::new().every_nth_instruction(1), move |_, _| {
            if stopping.load(Ordering::Relaxed) {
                return Err(mlua::Error::RuntimeError("shutting down".to_string()));
            }
            let used = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if used >= limit {
                return Err(mlua::Error::RuntimeError(
                    "instruction_limit exceeded".to_string(),
                ));
            }
            Ok(VmState::Continue)
        });
    }

    fn tally(&mut self, lua: &Lua) {
        self.usage.record(
            UsageType::Instructions,
            self.instruction_count.load(Ordering::Relaxed),
        );
        self.usage
            .record(UsageType::Memory, lua.used_memory() as u64);
        if let Some(ctx) = lua.app_data_ref::<RuntimeContext>() {
            self.usage
                .set(UsageType::Output, UsageStat::Current, ctx.output_current);
            if ctx.output_maximum > self.usage.get(UsageType::Output, UsageStat::Maximum) {
                self.usage
                    .set(UsageType::Output, UsageStat::Maximum, ctx.output_maximum);
            }
        }
    }

    fn take_running_lua(&mut self) -> Result<Lua, SandboxError> {
        if self.status != Status::Running {
            return Err(SandboxError::NotRunning);
        }
        self.lua.take().ok_or(SandboxError::NotRunning)
    }

    /// Classifies a dispatch failure and decides whether the sandbox
    /// survives it.
    fn dispatch_failure(&mut self, lua: Lua, err: &mlua::Error, entry: &str) -> SandboxError {
        let text = match err {
            mlua::Error::FromLuaConversionError { .. } => {
                format!("{entry}() must return a status and optional error message")
            }
            _ => format!("{entry}() {}", error_text(err)),
        };
        let cooperative = text.ends_with("aborted") || text.ends_with("shutting down");
        if cooperative {
            // data-preserving exit: stay alive so state can be persisted
            self.lua = Some(lua);
            self.set_error(&text);
            return SandboxError::Script(text);
        }
        drop(lua);
        self.terminate(&text);
        if is_quota_error(err, &text) {
            SandboxError::Quota(text)
        } else {
            SandboxError::Script(text)
        }
    }

    /// Dispatches the script's `process_message()` entry point and returns
    /// the status it reported.
    pub fn process_message(&mut self) -> Result<i32, Error> {
        let lua = self.take_running_lua()?;
        self.arm_hook(&lua);
        let entry = match lookup_entry(&lua, "process_message") {
            Some(entry) => entry,
            None => {
                drop(lua);
                self.terminate("process_message() function was not found");
                return Err(SandboxError::Script(self.error_message.clone()).into());
            }
        };
        let result: mlua::Result<(f64, Option<String>)> = entry.call(());
        lua.remove_hook();
        self.tally(&lua);
        match result {
            Ok((status, message)) => {
                self.lua = Some(lua);
                if let Some(message) = message {
                    self.set_error(&message);
                }
                Ok(status as i32)
            }
            Err(err) => Err(self.dispatch_failure(lua, &err, "process_message").into()),
        }
    }

    /// Dispatches the script's `timer_event(ns)` entry point, then runs a
    /// garbage collection.
    pub fn timer_event(&mut self, ns: i64) -> Result<(), Error> {
        let lua = self.take_running_lua()?;
        self.arm_hook(&lua);
        let entry = match lookup_entry(&lua, "timer_event") {
            Some(entry) => entry,
            None => {
                drop(lua);
                self.terminate("timer_event() function was not found");
                return Err(SandboxError::Script(self.error_message.clone()).into());
            }
        };
        let result: mlua::Result<()> = entry.call(ns);
        lua.remove_hook();
        match result {
            Ok(()) => {
                let _ = lua.gc_collect();
                self.tally(&lua);
                self.lua = Some(lua);
                Ok(())
            }
            Err(err) => {
                self.tally(&lua);
                Err(self.dispatch_failure(lua, &err, "timer_event").into())
            }
        }
    }

    /// One usage statistic.
    pub fn usage(&self, utype: UsageType, ustat: UsageStat) -> u64 {
        if utype == UsageType::Memory && ustat == UsageStat::Current {
            if let Some(lua) = &self.lua {
                return lua.used_memory() as u64;
            }
        }
        self.usage.get(utype, ustat)
    }

    /// Lifecycle state.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The last failure in human readable form.
    pub fn last_error(&self) -> &str {
        &self.error_message
    }

    /// Requests a cooperative shutdown: the next script instruction raises
    /// `"shutting down"`, which reports failure without terminating so the
    /// embedder can still persist state.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(lua) = &self.lua {
            self.arm_hook(lua);
        }
    }

    /// Tears the sandbox down, optionally preserving the script's global
    /// state to `state_path` first. Persistence failures are returned, and
    /// the partial state file is removed.
    pub fn destroy(mut self, state_path: Option<&Path>) -> Result<(), Error> {
        let mut result = Ok(());
        if let (Some(path), Some(lua)) = (state_path, self.lua.as_ref()) {
            let outcome = match lua.app_data_mut::<RuntimeContext>() {
                Some(mut ctx) => serialize::preserve_globals(lua, path, &mut ctx.output),
                None => serialize::preserve_globals(lua, path, &mut OutputBuffer::new()),
            };
            if let Err(error) = outcome {
                let _ = fs::remove_file(path);
                result = Err(SandboxError::Preserve(error.to_string()).into());
            } else {
                debug!("preserved state to {}", path.display());
            }
        }
        self.lua = None;
        result
    }

    fn set_error(&mut self, message: &str) {
        self.error_message = message.chars().take(MAX_ERROR_LEN).collect();
    }

    fn terminate(&mut self, message: &str) {
        warn!("sandbox terminated: {message}");
        self.set_error(message);
        self.lua = None;
        self.usage.set(UsageType::Memory, UsageStat::Current, 0);
        self.status = Status::Terminated;
    }
}

/// Looks up a script entry point, tolerating it being shadowed by a
/// non-function value.
fn lookup_entry(lua: &Lua, name: &str) -> Option<Function> {
    lua.globals().get::<Option<Function>>(name).ok().flatten()
}

/// The failure text without interpreter decoration: unwraps callback
/// causes and strips the traceback so suffix matching works.
fn error_text(err: &mlua::Error) -> String {
    let text = match err {
        mlua::Error::RuntimeError(message)
        | mlua::Error::MemoryError(message)
        | mlua::Error::SyntaxError {
            message,
            incomplete_input: _,
        } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => error_text(cause),
        other => other.to_string(),
    };
    match text.split("\nstack traceback:").next() {
        Some(first) => first.trim_end().to_string(),
        None => text,
    }
}

fn is_quota_error(err: &mlua::Error, text: &str) -> bool {
    fn is_memory(err: &mlua::Error) -> bool {
        match err {
            mlua::Error::MemoryError(_) => true,
            mlua::Error::CallbackError { cause, .. } => is_memory(cause),
            _ => false,
        }
    }
    is_memory(err)
        || text.ends_with("instruction_limit exceeded")
        || text.ends_with("output_limit exceeded")
}
