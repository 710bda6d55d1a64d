//! One-shot script execution.
//!
//! Every [`ScriptRunner::run`] call builds a fresh QuickJS runtime, installs
//! the sandbox globals, evaluates the script and then keeps the VM alive
//! until all bridged crypto calls have settled. Nothing survives the call:
//! the key registry, pending set and VM are per run.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::{Context, Ctx, Runtime, Value};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{self, SessionState, SharedSession};
use crate::config::SandboxConfig;
use crate::console::{self, ConsoleEntry, ConsoleLog};
use crate::crypto_module::{CryptoBridge, SubtleCall};
use crate::environment::Environments;
use crate::error::{Error, Result, ScriptFailure};
use crate::keepalive::{QuiescenceDriver, await_quiescence};
use crate::key_registry::{Clock, KeyRegistry, SystemClock};
use crate::marshal::to_host;
use crate::request::{RequestSnapshot, ResponseSnapshot};
use crate::test_tree::TestNode;
use crate::webcrypto::CryptoProvider;

/// Which hook a script runs as. Request mutations are only allowed in
/// pre-request scripts; expectations and the response only exist in test
/// scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptKind {
    #[default]
    #[serde(alias = "pre")]
    PreRequest,
    Test,
}

impl ScriptKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreRequest => "pre-request",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptInput {
    pub kind: ScriptKind,
    pub script: String,
    pub request: RequestSnapshot,
    pub environment: Environments,
    pub response: Option<ResponseSnapshot>,
}

impl ScriptInput {
    pub fn new(kind: ScriptKind, script: impl Into<String>) -> Self {
        Self {
            kind,
            script: script.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_request(mut self, request: RequestSnapshot) -> Self {
        self.request = request;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environments) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: ResponseSnapshot) -> Self {
        self.response = Some(response);
        self
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutcome {
    pub updated_request: RequestSnapshot,
    pub updated_envs: Environments,
    pub console_entries: Vec<ConsoleEntry>,
    pub test_results: TestNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    AwaitingAsync,
    Completed,
    Failed,
}

fn advance(state: &mut RunState, next: RunState) {
    tracing::debug!(
        event = "sandbox.run.state",
        from = ?*state,
        to = ?next,
        "Run state changed"
    );
    *state = next;
}

/// Human-readable message for a thrown VM value.
fn exception_message(value: &Value<'_>) -> String {
    if let Some(object) = value.as_object() {
        if let Ok(Some(message)) = object.get::<_, Option<String>>("message") {
            return message;
        }
    }
    let host = to_host(value);
    if host.is_nullish() {
        "Unknown error".to_string()
    } else {
        host.to_js_string()
    }
}

fn vm_error(ctx: &Ctx<'_>, err: &rquickjs::Error) -> String {
    if err.is_exception() {
        exception_message(&ctx.catch())
    } else {
        err.to_string()
    }
}

/// Settles crypto calls and runs Promise jobs on the run's VM.
struct VmDriver<'a> {
    runtime: &'a Runtime,
    context: &'a Context,
    bridge: &'a CryptoBridge,
}

impl QuiescenceDriver<SubtleCall> for VmDriver<'_> {
    fn settle(&mut self, op_id: u64, op: SubtleCall) -> Result<()> {
        self.context.with(|ctx| {
            self.bridge
                .settle(&ctx, op_id, op)
                .map_err(|err| Error::runtime(vm_error(&ctx, &err)))
        })
    }

    fn drain_jobs(&mut self) -> Result<usize> {
        let mut ran = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => return Ok(ran),
                Err(job) => {
                    let message = job.0.with(|ctx| exception_message(&ctx.catch()));
                    return Err(Error::runtime(message));
                }
            }
        }
    }
}

pub struct ScriptRunner {
    config: SandboxConfig,
    provider: Option<Arc<dyn CryptoProvider>>,
    clock: Arc<dyn Clock>,
}

impl ScriptRunner {
    pub fn new(config: SandboxConfig, provider: Option<Arc<dyn CryptoProvider>>) -> Self {
        Self {
            config,
            provider,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock the key registry uses for TTLs.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn create_vm(&self) -> rquickjs::Result<(Runtime, Context)> {
        let runtime = Runtime::new()?;
        if self.config.memory_limit_bytes > 0 {
            runtime.set_memory_limit(self.config.memory_limit_bytes);
        }
        if self.config.max_stack_size_bytes > 0 {
            runtime.set_max_stack_size(self.config.max_stack_size_bytes);
        }
        let context = Context::full(&runtime)?;
        Ok((runtime, context))
    }

    /// Run one script to completion, including every crypto operation it
    /// started.
    pub fn run(&self, input: ScriptInput) -> std::result::Result<ScriptOutcome, ScriptFailure> {
        let ScriptInput {
            kind,
            script,
            request,
            environment,
            response,
        } = input;
        let console = ConsoleLog::default();
        let fail = |message: String| {
            tracing::debug!(
                event = "sandbox.run.failed",
                kind = kind.as_str(),
                message = message.as_str(),
                "Script run failed"
            );
            ScriptFailure::new(message, console.borrow().clone())
        };

        let mut state = RunState::Created;
        let registry = Rc::new(RefCell::new(KeyRegistry::new(
            Arc::clone(&self.clock),
            self.config.key_ttl_ms,
            self.provider.clone(),
        )));
        let bridge = CryptoBridge::new(self.provider.clone(), Rc::clone(&registry));
        let session: SharedSession = Rc::new(RefCell::new(SessionState::new(
            kind,
            environment,
            request,
            response,
        )));

        let (runtime, context) = self.create_vm().map_err(|err| {
            registry.borrow_mut().dispose();
            fail(err.to_string())
        })?;

        advance(&mut state, RunState::Running);
        let evaluated = context.with(|ctx| -> std::result::Result<(), String> {
            console::install(&ctx, &console).map_err(|err| vm_error(&ctx, &err))?;
            bridge.install(&ctx).map_err(|err| vm_error(&ctx, &err))?;
            bootstrap::install(&ctx, &session).map_err(|err| vm_error(&ctx, &err))?;
            ctx.eval::<(), _>(script.as_str())
                .map_err(|err| vm_error(&ctx, &err))
        });
        if let Err(message) = evaluated {
            advance(&mut state, RunState::Failed);
            bridge.tracker().borrow_mut().abort();
            return Err(fail(message));
        }

        advance(&mut state, RunState::AwaitingAsync);
        let mut driver = VmDriver {
            runtime: &runtime,
            context: &context,
            bridge: &bridge,
        };
        match await_quiescence(bridge.tracker(), &mut driver, &self.config.keepalive()) {
            Ok(report) => tracing::debug!(
                event = "sandbox.run.settled",
                rounds = report.rounds,
                settled = report.settled,
                "Async work settled"
            ),
            Err(err) => {
                advance(&mut state, RunState::Failed);
                let message = match err {
                    Error::Runtime(message) => message,
                    other => other.to_string(),
                };
                return Err(fail(message));
            }
        }
        advance(&mut state, RunState::Completed);

        let mut session = session.borrow_mut();
        Ok(ScriptOutcome {
            updated_request: std::mem::take(&mut session.request),
            updated_envs: std::mem::take(&mut session.envs),
            console_entries: console.borrow().clone(),
            test_results: std::mem::take(&mut session.tests).finish(),
        })
    }
}
