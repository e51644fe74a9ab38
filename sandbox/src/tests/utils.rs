//! Test fixtures: a scriptable mock pipeline host and sandbox builders.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sluice_traits::{
    ConfigValue, FieldValue, InjectError, MessageField, PipelineHost, WriteError, WriteValue,
};
use tempfile::TempDir;

use crate::{PluginType, Sandbox};

/// Everything the mock host has been asked to do, shared with the test.
#[derive(Default)]
pub(crate) struct Inbox {
    pub(crate) injected: Vec<(Vec<u8>, String, String)>,
    pub(crate) written: Vec<String>,
}

pub(crate) struct MockHost {
    pub(crate) config: HashMap<String, ConfigValue>,
    pub(crate) message: HashMap<String, FieldValue>,
    pub(crate) fields: Vec<MessageField>,
    pub(crate) cursor: usize,
    pub(crate) inbox: Arc<Mutex<Inbox>>,
    pub(crate) inject_error: Option<InjectError>,
}

impl Default for MockHost {
    fn default() -> Self {
        MockHost {
            config: HashMap::new(),
            message: HashMap::new(),
            fields: Vec::new(),
            cursor: 0,
            inbox: Arc::new(Mutex::new(Inbox::default())),
            inject_error: None,
        }
    }
}

impl PipelineHost for MockHost {
    fn read_config(&self, name: &str) -> Option<ConfigValue> {
        self.config.get(name).cloned()
    }

    fn read_message(
        &self,
        field: &str,
        field_index: usize,
        array_index: usize,
    ) -> Option<FieldValue> {
        if field_index == 0 && array_index == 0 {
            self.message.get(field).cloned()
        } else {
            self.message
                .get(&format!("{field}:{field_index}:{array_index}"))
                .cloned()
        }
    }

    fn read_next_field(&mut self) -> Option<MessageField> {
        let field = self.fields.get(self.cursor).cloned();
        if field.is_some() {
            self.cursor += 1;
        }
        field
    }

    fn write_message(
        &mut self,
        field: &str,
        value: WriteValue<'_>,
        representation: &str,
        field_index: usize,
        array_index: usize,
        has_array_index: bool,
    ) -> Result<(), WriteError> {
        if field.is_empty() {
            return Err(WriteError::InvalidName);
        }
        self.inbox.lock().unwrap().written.push(format!(
            "{field}={value:?} rep={representation} fi={field_index} ai={array_index} has={has_array_index}"
        ));
        Ok(())
    }

    fn inject_message(
        &mut self,
        payload: &[u8],
        msg_type: &str,
        name: &str,
    ) -> Result<(), InjectError> {
        if let Some(error) = self.inject_error {
            return Err(error);
        }
        self.inbox.lock().unwrap().injected.push((
            payload.to_vec(),
            msg_type.to_string(),
            name.to_string(),
        ));
        Ok(())
    }
}

/// One sandbox plus the handles a test needs to observe it.
pub(crate) struct Fixture {
    pub(crate) sandbox: Sandbox,
    pub(crate) inbox: Arc<Mutex<Inbox>>,
    pub(crate) dir: TempDir,
}

impl Fixture {
    pub(crate) fn state_path(&self) -> PathBuf {
        self.dir.path().join("plugin.state")
    }
}

pub(crate) fn fixture_with_host(
    source: &str,
    plugin_type: PluginType,
    host: MockHost,
    memory_limit: u64,
    instruction_limit: u64,
    output_limit: u64,
) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("plugin.lua");
    fs::write(&script, source).unwrap();
    let inbox = Arc::clone(&host.inbox);
    let sandbox = Sandbox::create(
        Box::new(host),
        script,
        plugin_type,
        memory_limit,
        instruction_limit,
        output_limit,
    )
    .unwrap();
    Fixture { sandbox, inbox, dir }
}

/// A sandbox over an empty host with roomy limits.
pub(crate) fn fixture(source: &str, plugin_type: PluginType) -> Fixture {
    fixture_with_host(
        source,
        plugin_type,
        MockHost::default(),
        crate::MAX_MEMORY,
        100_000,
        crate::MAX_OUTPUT,
    )
}

/// A running filter sandbox; panics when the script fails to load.
pub(crate) fn running(source: &str) -> Fixture {
    let mut fx = fixture(source, PluginType::Filter);
    fx.sandbox.init(None).unwrap();
    fx
}
