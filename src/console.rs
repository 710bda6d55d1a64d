//! Console capture.
//!
//! Scripts never write to a real console; each `console.*` call is recorded
//! as a [`ConsoleEntry`] with its level and marshaled arguments.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Value};
use serde::Serialize;

use crate::marshal::{HostValue, to_host};

/// Console method a script called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    pub const ALL: [Self; 5] = [Self::Log, Self::Info, Self::Warn, Self::Error, Self::Debug];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }

    pub fn parse(level: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == level)
            .unwrap_or(Self::Log)
    }
}

/// One recorded console call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub args: Vec<HostValue>,
}

pub type ConsoleLog = Rc<RefCell<Vec<ConsoleEntry>>>;

const CONSOLE_JS: &str = r"
(function () {
    const native = globalThis.__hopp_console_native;
    const levels = ['log', 'info', 'warn', 'error', 'debug'];
    const c = {};
    for (const level of levels) {
        c[level] = (...args) => native(level, ...args);
    }
    c.trace = c.debug;
    globalThis.console = c;
    delete globalThis.__hopp_console_native;
})();
";

/// Install `console` as a global that appends into `log`.
pub fn install<'js>(ctx: &Ctx<'js>, log: &ConsoleLog) -> rquickjs::Result<()> {
    let sink = Rc::clone(log);
    let native = Function::new(
        ctx.clone(),
        move |level: String, args: Rest<Value<'js>>| {
            let entry = ConsoleEntry {
                level: ConsoleLevel::parse(&level),
                args: args.0.iter().map(to_host).collect(),
            };
            tracing::trace!(
                event = "sandbox.console",
                level = entry.level.as_str(),
                args = entry.args.len(),
                "Captured console call"
            );
            sink.borrow_mut().push(entry);
        },
    )?;
    ctx.globals().set("__hopp_console_native", native)?;
    ctx.eval::<(), _>(CONSOLE_JS)
}
