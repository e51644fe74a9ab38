//! End-to-end sandbox scenarios against a mock pipeline host.

mod utils;

use std::fs;

use mlua::Lua;
use sluice_traits::{ConfigValue, FieldValue, InjectError, MessageField};

use crate::tests::utils::{fixture, fixture_with_host, running, MockHost};
use crate::{ErrorKind, PluginType, Status, UsageStat, UsageType, MAX_MEMORY, MAX_OUTPUT};

#[test]
fn create_rejects_limits_above_the_ceilings() {
    let host = MockHost::default();
    let err = crate::Sandbox::create(
        Box::new(host),
        "missing.lua",
        PluginType::Filter,
        MAX_MEMORY + 1,
        1000,
        1000,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn init_fails_on_a_missing_script() {
    let mut fx = fixture("return 0", PluginType::Filter);
    fs::remove_file(fx.dir.path().join("plugin.lua")).unwrap();
    let err = fx.sandbox.init(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(fx.sandbox.status(), Status::Terminated);
    assert!(fx.sandbox.last_error().starts_with("init()"));
}

#[test]
fn init_fails_on_a_syntax_error() {
    let mut fx = fixture("function process_message( return end", PluginType::Filter);
    assert!(fx.sandbox.init(None).is_err());
    assert_eq!(fx.sandbox.status(), Status::Terminated);
}

#[test]
fn dangerous_entry_points_are_removed() {
    let mut fx = fixture(
        r#"
            assert(print == nil)
            assert(dofile == nil)
            assert(loadstring == nil)
            assert(load == nil)
            assert(collectgarbage == nil)
            assert(rawget == nil)
            assert(rawset == nil)
            assert(getmetatable == nil)
            assert(os.execute == nil)
            assert(os.exit == nil)
            assert(os.remove == nil)
            assert(os.time ~= nil)
            assert(string.rep ~= nil)
            assert(table.concat ~= nil)
            assert(math.floor ~= nil)
            local ok, err = pcall(require, "io")
            assert(not ok)
            assert(string.find(tostring(err), "library 'io' is not available", 1, true))
            assert(require("circular_buffer") ~= nil)
            assert(require("string") == string)
            function process_message() return 0 end
        "#,
        PluginType::Filter,
    );
    fx.sandbox.init(None).unwrap();
    assert_eq!(fx.sandbox.status(), Status::Running);
}

#[test]
fn output_is_renamed_to_add_to_payload_after_init() {
    let mut fx = running(
        r#"
            assert(output ~= nil) -- visible while the script loads
            function process_message()
                if output ~= nil then return 1 end
                if add_to_payload == nil then return 2 end
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
}

#[test]
fn memory_quota_terminates_the_sandbox() {
    let mut fx = fixture_with_host(
        r#"
            buckets = {}
            function process_message()
                for i = 1, 100000 do
                    buckets[#buckets + 1] = string.rep("x", 1000)
                end
                return 0
            end
        "#,
        PluginType::Filter,
        MockHost::default(),
        256 * 1024,
        crate::MAX_INSTRUCTIONS,
        MAX_OUTPUT,
    );
    fx.sandbox.init(None).unwrap();
    let err = fx.sandbox.process_message().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Quota);
    assert_eq!(fx.sandbox.status(), Status::Terminated);
    assert!(fx.sandbox.last_error().contains("memory"));
    assert!(fx.sandbox.usage(UsageType::Memory, UsageStat::Maximum) <= 256 * 1024);
    assert_eq!(fx.sandbox.usage(UsageType::Memory, UsageStat::Current), 0);
}

#[test]
fn instruction_quota_terminates_the_sandbox() {
    let mut fx = fixture_with_host(
        "function process_message() while true do end return 0 end",
        PluginType::Filter,
        MockHost::default(),
        MAX_MEMORY,
        1000,
        MAX_OUTPUT,
    );
    fx.sandbox.init(None).unwrap();
    let err = fx.sandbox.process_message().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Quota);
    assert_eq!(fx.sandbox.status(), Status::Terminated);
    assert!(fx.sandbox.last_error().contains("instruction_limit exceeded"));
    assert!(fx.sandbox.usage(UsageType::Instructions, UsageStat::Maximum) >= 1000);
    // one-shot: later dispatches are rejected outright
    assert!(fx.sandbox.process_message().is_err());
}

#[test]
fn output_quota_is_a_script_error() {
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                for i = 1, 20 do
                    add_to_payload(string.rep("y", 100))
                end
                return 0
            end
        "#,
        PluginType::Filter,
        MockHost::default(),
        MAX_MEMORY,
        100_000,
        1024,
    );
    fx.sandbox.init(None).unwrap();
    let err = fx.sandbox.process_message().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Quota);
    assert!(fx.sandbox.last_error().contains("output_limit exceeded"));
    assert_eq!(fx.sandbox.status(), Status::Terminated);
}

#[test]
fn missing_entry_point_terminates() {
    let mut fx = running("function timer_event(ns) end");
    let err = fx.sandbox.process_message().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Script);
    assert!(fx
        .sandbox
        .last_error()
        .contains("process_message() function was not found"));
    assert_eq!(fx.sandbox.status(), Status::Terminated);
}

#[test]
fn wrong_return_shape_terminates() {
    let mut fx = running("function process_message() return \"nope\" end");
    assert!(fx.sandbox.process_message().is_err());
    assert_eq!(fx.sandbox.status(), Status::Terminated);
    assert!(fx.sandbox.last_error().contains("must return a status"));
}

#[test]
fn script_status_and_error_are_reported() {
    let mut fx = running(
        r#"
            function process_message()
                return -2, "skipped: wrong type"
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), -2);
    assert_eq!(fx.sandbox.status(), Status::Running);
    assert_eq!(fx.sandbox.last_error(), "skipped: wrong type");
}

#[test]
fn cooperative_abort_keeps_the_sandbox_alive() {
    let mut fx = running(
        r#"
            count = 7
            function process_message()
                error("saving state aborted")
            end
        "#,
    );
    let err = fx.sandbox.process_message().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Script);
    assert_eq!(fx.sandbox.status(), Status::Running);
    assert!(fx.sandbox.last_error().ends_with("aborted"));
    // the sandbox survived, so its globals can still be persisted
    let state = fx.state_path();
    fx.sandbox.destroy(Some(&state)).unwrap();
    let preserved = fs::read_to_string(&state).unwrap();
    assert!(preserved.contains("_G[\"count\"] = 7"));
}

#[test]
fn stop_aborts_the_next_dispatch_without_terminating() {
    let mut fx = running(
        r#"
            ticks = 3
            function process_message() return 0 end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    fx.sandbox.stop();
    assert!(fx.sandbox.process_message().is_err());
    assert_eq!(fx.sandbox.status(), Status::Running);
    assert!(fx.sandbox.last_error().ends_with("shutting down"));
    let state = fx.state_path();
    fx.sandbox.destroy(Some(&state)).unwrap();
    assert!(fs::read_to_string(&state)
        .unwrap()
        .contains("_G[\"ticks\"] = 3"));
}

#[test]
fn timer_event_passes_nanoseconds_and_collects_garbage() {
    let mut fx = running(
        r#"
            ticks = 0
            function process_message() return 0 end
            function timer_event(ns)
                ticks = ticks + 1
                last_ns = ns
            end
        "#,
    );
    fx.sandbox.timer_event(1_234_567_890).unwrap();
    fx.sandbox.timer_event(2_000_000_000).unwrap();
    let state = fx.state_path();
    fx.sandbox.destroy(Some(&state)).unwrap();
    let preserved = fs::read_to_string(&state).unwrap();
    assert!(preserved.contains("_G[\"ticks\"] = 2"));
    assert!(preserved.contains("_G[\"last_ns\"] = 2000000000"));
}

#[test]
fn host_callbacks_reach_the_script() {
    let mut host = MockHost::default();
    host.config
        .insert("greeting".to_string(), ConfigValue::String("hello".into()));
    host.config
        .insert("threshold".to_string(), ConfigValue::Double(0.5));
    host.config
        .insert("verbose".to_string(), ConfigValue::Bool(true));
    host.message
        .insert("Type".to_string(), FieldValue::Bytes(b"log".to_vec()));
    host.message
        .insert("Severity".to_string(), FieldValue::Int(7));
    host.message
        .insert("Fields[size]:1:0".to_string(), FieldValue::Double(9.5));
    host.fields.push(MessageField {
        name: "size".to_string(),
        value: FieldValue::Double(44.5),
        representation: "B".to_string(),
        count: 1,
    });
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                if read_config("greeting") ~= "hello" then return 1 end
                if read_config("threshold") ~= 0.5 then return 2 end
                if read_config("verbose") ~= true then return 3 end
                if read_config("missing") ~= nil then return 4 end
                if read_message("Type") ~= "log" then return 5 end
                if read_message("Severity") ~= 7 then return 6 end
                if read_message("Fields[size]", 1, 0) ~= 9.5 then return 7 end
                local typ, name, value, rep, count = read_next_field()
                if typ ~= 3 or name ~= "size" or value ~= 44.5 then return 8 end
                if rep ~= "B" or count ~= 1 then return 9 end
                name = select(2, read_next_field())
                if name ~= nil then return 10 end
                local ok = pcall(read_message, "Type", -1)
                if ok then return 11 end
                return 0
            end
        "#,
        PluginType::Filter,
        host,
        MAX_MEMORY,
        100_000,
        MAX_OUTPUT,
    );
    fx.sandbox.init(None).unwrap();
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
}

#[test]
fn write_message_forwards_typed_values() {
    let mut fx = fixture(
        r#"
            function process_message()
                write_message("Payload", "replaced")
                write_message("Fields[count]", 41, "count", 0, 0)
                write_message("Fields[flag]", true)
                write_message("Fields[gone]", nil, "", 0, 1)
                return 0
            end
        "#,
        PluginType::Decoder,
    );
    fx.sandbox.init(None).unwrap();
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let inbox = fx.inbox.lock().unwrap();
    assert_eq!(inbox.written.len(), 4);
    assert!(inbox.written[0].starts_with("Payload=Str(\"replaced\")"));
    assert!(inbox.written[1].starts_with("Fields[count]=Double(41.0) rep=count"));
    assert!(inbox.written[2].starts_with("Fields[flag]=Bool(true)"));
    assert!(inbox.written[3].contains("Nil"));
    assert!(inbox.written[3].ends_with("ai=1 has=true"));
}

#[test]
fn write_message_failure_is_a_script_error() {
    let mut fx = fixture(
        "function process_message() write_message(\"\", 1) return 0 end",
        PluginType::Encoder,
    );
    fx.sandbox.init(None).unwrap();
    assert!(fx.sandbox.process_message().is_err());
    assert!(fx.sandbox.last_error().contains("write_message()"));
}

#[test]
fn plugin_types_condition_the_script_api() {
    let cases: &[(PluginType, &str)] = &[
        (
            PluginType::Input,
            r#"
                assert(read_config ~= nil and decode_message ~= nil)
                assert(inject_message ~= nil)
                assert(read_message == nil and read_next_field == nil)
                assert(write_message == nil and inject_payload == nil)
                assert(output == nil)
            "#,
        ),
        (
            PluginType::Output,
            r#"
                assert(read_config ~= nil and decode_message ~= nil)
                assert(read_message ~= nil and read_next_field ~= nil)
                assert(inject_message == nil and inject_payload == nil)
                assert(write_message == nil)
            "#,
        ),
        (
            PluginType::Filter,
            r#"
                assert(read_message ~= nil and read_next_field ~= nil)
                assert(inject_message ~= nil and inject_payload ~= nil)
                assert(output ~= nil)
                assert(write_message == nil)
            "#,
        ),
        (
            PluginType::Encoder,
            r#"
                assert(read_message ~= nil and inject_payload ~= nil)
                assert(write_message ~= nil)
            "#,
        ),
    ];
    for (plugin_type, body) in cases {
        let source = format!("{body}\nfunction process_message() return 0 end");
        let mut fx = fixture(&source, *plugin_type);
        fx.sandbox
            .init(None)
            .unwrap_or_else(|e| panic!("{plugin_type:?}: {e}"));
    }
}

#[test]
fn injected_messages_are_wire_encoded() {
    let mut fx = running(
        r#"
            function process_message()
                inject_message({
                    Timestamp = 1000000000,
                    Payload = "hi",
                    Fields = {{name = "k", value = 1}},
                })
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let inbox = fx.inbox.lock().unwrap();
    assert_eq!(inbox.injected.len(), 1);
    let (payload, msg_type, name) = &inbox.injected[0];
    assert_eq!(msg_type, "");
    assert_eq!(name, "");
    // uuid framing with version 4 and the RFC 4122 variant
    assert_eq!(payload[0], 0x0a);
    assert_eq!(payload[1], 16);
    assert_eq!(payload[2 + 6] >> 4, 4);
    assert_eq!(payload[2 + 8] >> 6, 2);
    // decode the rest back out
    let lua = Lua::new();
    let decoded = sluice_protobuf::decode_message(&lua, payload).unwrap();
    assert_eq!(decoded.get::<String>("Payload").unwrap(), "hi");
    assert_eq!(decoded.get::<i64>("Timestamp").unwrap(), 1_000_000_000);
    let fields: mlua::Table = decoded.get("Fields").unwrap();
    let entry: mlua::Table = fields.get(1).unwrap();
    assert_eq!(entry.get::<String>("name").unwrap(), "k");
    assert_eq!(entry.get::<f64>("value").unwrap(), 1.0);
    // the output buffer was handed back and reset; a second dispatch
    // injects a complete fresh message
    drop(inbox);
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let inbox = fx.inbox.lock().unwrap();
    assert_eq!(inbox.injected.len(), 2);
    let second = sluice_protobuf::decode_message(&lua, &inbox.injected[1].0).unwrap();
    assert_eq!(second.get::<String>("Payload").unwrap(), "hi");
}

#[test]
fn inject_payload_sends_the_staged_buffer() {
    let mut fx = running(
        r#"
            function process_message()
                add_to_payload("lines: ", 3, " flag: ", true, " none: ", nil)
                inject_payload("txt", "report")
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let inbox = fx.inbox.lock().unwrap();
    let (payload, msg_type, name) = &inbox.injected[0];
    assert_eq!(payload, b"lines: 3 flag: true none: nil");
    assert_eq!(msg_type, "txt");
    assert_eq!(name, "report");
}

#[test]
fn inject_failures_carry_the_host_reason() {
    let host = MockHost {
        inject_error: Some(InjectError::LoopLimit),
        ..MockHost::default()
    };
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                inject_payload("txt", "x", "data")
                return 0
            end
        "#,
        PluginType::Filter,
        host,
        MAX_MEMORY,
        100_000,
        MAX_OUTPUT,
    );
    fx.sandbox.init(None).unwrap();
    assert!(fx.sandbox.process_message().is_err());
    assert!(fx
        .sandbox
        .last_error()
        .contains("inject_payload() exceeded MaxMsgLoops"));
}

#[test]
fn inject_abort_is_cooperative() {
    let host = MockHost {
        inject_error: Some(InjectError::Aborted),
        ..MockHost::default()
    };
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                inject_payload("txt", "x", "data")
                return 0
            end
        "#,
        PluginType::Filter,
        host,
        MAX_MEMORY,
        100_000,
        MAX_OUTPUT,
    );
    fx.sandbox.init(None).unwrap();
    assert!(fx.sandbox.process_message().is_err());
    assert_eq!(fx.sandbox.status(), Status::Running);
    assert!(fx.sandbox.last_error().ends_with("aborted"));
}

#[test]
fn decode_message_round_trips_in_script() {
    // build a wire message out-of-band and serve it through the host
    let lua = Lua::new();
    let msg = lua.create_table().unwrap();
    msg.set("Payload", "ping").unwrap();
    let fields = lua.create_table().unwrap();
    let field = lua.create_table().unwrap();
    field.set("name", "n").unwrap();
    field.set("value", 5).unwrap();
    fields.raw_set(1, field).unwrap();
    msg.set("Fields", fields).unwrap();
    let mut out = sluice_output_buffer::OutputBuffer::new();
    sluice_protobuf::encode_message(&msg, &mut out).unwrap();
    let mut host = MockHost::default();
    host.message
        .insert("raw".to_string(), FieldValue::Bytes(out.as_bytes().to_vec()));
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                local bytes = read_message("raw")
                local msg = decode_message(bytes)
                if msg.Payload ~= "ping" then return 1 end
                if msg.Fields[1].name ~= "n" then return 2 end
                if msg.Fields[1].value ~= 5 then return 3 end
                return 0
            end
        "#,
        PluginType::Filter,
        host,
        MAX_MEMORY,
        100_000,
        MAX_OUTPUT,
    );
    fx.sandbox.init(None).unwrap();
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
}

#[test]
fn tables_emit_as_json_payloads() {
    let mut fx = running(
        r#"
            function process_message()
                add_to_payload({_name = "doc", value = 1})
                inject_payload("json", "stats")
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let inbox = fx.inbox.lock().unwrap();
    let (payload, msg_type, _) = &inbox.injected[0];
    assert_eq!(payload, b"{\"doc\":{\"value\":1}}\n");
    assert_eq!(msg_type, "json");
}

#[test]
fn json_emission_refuses_cycles() {
    let mut fx = running(
        r#"
            knot = {}
            knot.me = knot
            function process_message()
                add_to_payload(knot)
                return 0
            end
        "#,
    );
    assert!(fx.sandbox.process_message().is_err());
    assert!(fx
        .sandbox
        .last_error()
        .contains("table contains an internal or circular reference"));
}

#[test]
fn circular_buffer_window_advance_in_script() {
    let mut fx = running(
        r#"
            data = circular_buffer.new(3, 1, 60)
            function process_message()
                if data:add(60e9, 1, 1) ~= 1 then return 1 end
                if data:add(180e9, 1, 10) ~= 10 then return 2 end
                if data:get(60e9, 1) ~= 1 then return 3 end
                if data:add(360e9, 1, 100) ~= 100 then return 4 end
                if data:get(60e9, 1) ~= nil then return 5 end
                if data:compute("sum", 1) ~= 100 then return 6 end
                local ok = pcall(function() data:set(360e9, 9, 1) end)
                if ok then return 7 end
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
}

#[test]
fn preserved_globals_restore_structurally() {
    let mut fx = running(
        r#"
            a = {1, 2, 3}
            b = {nested = a, label = "shared\nlabel"}
            b.selfref = b
            n = 3.25
            flag = true
            hidden_fn = function() end
            function process_message() return 0 end
        "#,
    );
    let state = fx.state_path();
    fx.sandbox.destroy(Some(&state)).unwrap();
    let state_text = fs::read_to_string(&state).unwrap();
    // functions are never preserved
    assert!(!state_text.contains("hidden_fn"));
    let mut restored = fixture(
        r#"
            function process_message()
                if a[2] ~= 2 then return 1 end
                if b.nested ~= a then return 2 end
                if b.selfref ~= b then return 3 end
                if b.label ~= "shared\nlabel" then return 4 end
                if n ~= 3.25 then return 5 end
                if flag ~= true then return 6 end
                return 0
            end
        "#,
        PluginType::Filter,
    );
    let restored_state = restored.dir.path().join("plugin.state");
    fs::write(&restored_state, &state_text).unwrap();
    restored.sandbox.init(Some(&restored_state)).unwrap();
    assert_eq!(restored.sandbox.process_message().unwrap(), 0);
}

#[test]
fn delta_buffers_round_trip_and_emit_cbufd() {
    let mut fx = running(
        r#"
            counters = circular_buffer.new(2, 1, 60, true)
            function process_message()
                counters:add(60e9, 1, 5)
                counters:add(60e9, 1, 7)
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let state = fx.state_path();
    fx.sandbox.destroy(Some(&state)).unwrap();
    let state_text = fs::read_to_string(&state).unwrap();
    assert!(state_text.contains("circular_buffer.new(2, 1, 60, true)"));

    let mut restored = fixture(
        r#"
            counters = circular_buffer.new(2, 1, 60, true)
            counters:format("cbufd")
            function process_message()
                if counters:get(60e9, 1) ~= 12 then return 1 end
                inject_payload("cbufd", "counters", counters)
                return 0
            end
        "#,
        PluginType::Filter,
    );
    let restored_state = restored.dir.path().join("plugin.state");
    fs::write(&restored_state, &state_text).unwrap();
    restored.sandbox.init(Some(&restored_state)).unwrap();
    assert_eq!(restored.sandbox.process_message().unwrap(), 0);
    let inbox = restored.inbox.lock().unwrap();
    let (payload, msg_type, name) = &inbox.injected[0];
    let text = String::from_utf8(payload.clone()).unwrap();
    assert!(text.ends_with("60\t12\n"));
    assert_eq!(text.lines().count(), 2); // header plus one delta row
    assert_eq!(msg_type, "cbufd");
    assert_eq!(name, "counters");
}

#[test]
fn restore_failure_terminates() {
    let mut fx = fixture("function process_message() return 0 end", PluginType::Filter);
    let state = fx.dir.path().join("plugin.state");
    fs::write(&state, "this is not lua (((").unwrap();
    let err = fx.sandbox.init(Some(&state)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert_eq!(fx.sandbox.status(), Status::Terminated);
    assert!(fx.sandbox.last_error().contains("restore_global_data"));
}

#[test]
fn output_usage_stays_within_the_limit_at_every_return() {
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                add_to_payload(string.rep("x", 100))
                return 0
            end
        "#,
        PluginType::Filter,
        MockHost::default(),
        MAX_MEMORY,
        100_000,
        1024,
    );
    fx.sandbox.init(None).unwrap();
    let mut previous = 0;
    for _ in 0..5 {
        assert_eq!(fx.sandbox.process_message().unwrap(), 0);
        let current = fx.sandbox.usage(UsageType::Output, UsageStat::Current);
        assert!(current <= fx.sandbox.usage(UsageType::Output, UsageStat::Limit));
        assert!(current > previous); // the staged payload accumulates
        assert!(fx.sandbox.usage(UsageType::Output, UsageStat::Maximum) >= current);
        previous = current;
    }
}

#[test]
fn staged_payload_accumulates_across_dispatches() {
    let mut fx = running(
        r#"
            count = 0
            function process_message()
                count = count + 1
                add_to_payload("x")
                if count == 3 then
                    inject_payload("txt", "accumulated")
                end
                return 0
            end
        "#,
    );
    for _ in 0..3 {
        assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    }
    let inbox = fx.inbox.lock().unwrap();
    assert_eq!(inbox.injected.len(), 1);
    assert_eq!(inbox.injected[0].0, b"xxx");
}

#[test]
fn restore_runs_outside_the_instruction_quota() {
    let mut fx = fixture_with_host(
        r#"
            function process_message()
                if big == nil then return 1 end
                if #big ~= 500 then return 2 end
                return 0
            end
        "#,
        PluginType::Filter,
        MockHost::default(),
        MAX_MEMORY,
        1000,
        MAX_OUTPUT,
    );
    // a state file that takes far more than the per-dispatch budget to run
    let mut state_text = String::from("_G[\"big\"] = {}\n");
    for i in 1..=500 {
        state_text.push_str(&format!("_G[\"big\"][{i}] = {i}\n"));
    }
    let state = fx.state_path();
    fs::write(&state, state_text).unwrap();
    fx.sandbox.init(Some(&state)).unwrap();
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
}

#[test]
fn minimal_injected_message_still_carries_uuid_and_timestamp() {
    let mut fx = running(
        r#"
            function process_message()
                inject_message({})
                return 0
            end
        "#,
    );
    assert_eq!(fx.sandbox.process_message().unwrap(), 0);
    let inbox = fx.inbox.lock().unwrap();
    let lua = Lua::new();
    let decoded = sluice_protobuf::decode_message(&lua, &inbox.injected[0].0).unwrap();
    assert_eq!(decoded.get::<mlua::String>("Uuid").unwrap().as_bytes().len(), 16);
    assert!(decoded.get::<i64>("Timestamp").unwrap() > 0);
}

#[test]
fn from_config_builds_a_sandbox() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("plugin.lua");
    fs::write(&script, "function process_message() return 0 end").unwrap();
    let config: crate::SandboxConfig = toml::from_str(&format!(
        "script_path = {:?}\ninstruction_limit = 5000\nplugin_type = \"encoder\"",
        script
    ))
    .unwrap();
    let mut sandbox =
        crate::Sandbox::from_config(Box::new(MockHost::default()), &config).unwrap();
    sandbox.init(config.state_path.as_deref()).unwrap();
    assert_eq!(sandbox.usage(UsageType::Instructions, UsageStat::Limit), 5000);
    assert_eq!(sandbox.process_message().unwrap(), 0);
    sandbox.destroy(None).unwrap();
}

#[test]
fn usage_reports_limits_and_live_memory() {
    let mut fx = running("function process_message() return 0 end");
    assert_eq!(
        fx.sandbox.usage(UsageType::Instructions, UsageStat::Limit),
        100_000
    );
    assert!(fx.sandbox.usage(UsageType::Memory, UsageStat::Current) > 0);
    fx.sandbox.process_message().unwrap();
    assert!(fx.sandbox.usage(UsageType::Instructions, UsageStat::Current) > 0);
    assert!(
        fx.sandbox.usage(UsageType::Instructions, UsageStat::Maximum)
            >= fx.sandbox.usage(UsageType::Instructions, UsageStat::Current)
    );
}
