//! Common test infrastructure for `hopp_sandbox` integration tests.
//!
//! Runners here use a zero poll interval so keepalive grace rounds do not
//! sleep.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use hopp_sandbox::console::ConsoleEntry;
use hopp_sandbox::request::{RequestSnapshot, ResponseSnapshot};
use hopp_sandbox::test_tree::{ExpectStatus, TestNode};
use hopp_sandbox::{
    CryptoProvider, NativeCrypto, SandboxConfig, ScriptFailure, ScriptInput, ScriptKind,
    ScriptOutcome, ScriptRunner,
};

/// Install a test-writer subscriber once; `RUST_LOG` selects the events.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn fast_config() -> SandboxConfig {
    SandboxConfig {
        keepalive_poll_interval_ms: 0,
        ..SandboxConfig::default()
    }
}

pub fn runner_with(provider: Option<Arc<dyn CryptoProvider>>) -> ScriptRunner {
    init_tracing();
    ScriptRunner::new(fast_config(), provider)
}

/// Runner backed by the native crypto provider.
pub fn runner() -> ScriptRunner {
    runner_with(Some(Arc::new(NativeCrypto::new())))
}

pub fn try_run(input: ScriptInput) -> Result<ScriptOutcome, ScriptFailure> {
    runner().run(input)
}

pub fn run(input: ScriptInput) -> ScriptOutcome {
    match try_run(input) {
        Ok(outcome) => outcome,
        Err(failure) => panic!("script failed: {failure} (console: {:?})", failure.console_entries),
    }
}

pub fn run_pre(script: &str) -> ScriptOutcome {
    run(ScriptInput::new(ScriptKind::PreRequest, script))
}

pub fn run_test(script: &str) -> ScriptOutcome {
    run(ScriptInput::new(ScriptKind::Test, script))
}

pub fn sample_request() -> RequestSnapshot {
    RequestSnapshot::new("https://api.example.com/users?page=1", "GET")
}

pub fn json_response(status: u16, body: serde_json::Value) -> ResponseSnapshot {
    ResponseSnapshot::new(status, body)
}

/// Console lines with arguments joined by a space.
pub fn console_lines(entries: &[ConsoleEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            entry
                .args
                .iter()
                .map(hopp_sandbox::HostValue::to_js_string)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// Every expectation in the tree, depth first.
pub fn expectations(node: &TestNode) -> Vec<(ExpectStatus, String)> {
    node.all_results()
        .into_iter()
        .map(|result| (result.status, result.message.clone()))
        .collect()
}

pub fn messages_with(node: &TestNode, status: ExpectStatus) -> Vec<String> {
    expectations(node)
        .into_iter()
        .filter(|(candidate, _)| *candidate == status)
        .map(|(_, message)| message)
        .collect()
}
