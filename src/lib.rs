//! hopp-sandbox - QuickJS sandbox for API request scripts
//!
//! Runs pre-request and test scripts against a request, its environments
//! and (for tests) a response snapshot, inside a fresh QuickJS VM per run.
//! Scripts see the `pw`, `hopp` and `pm` namespaces, a captured `console`,
//! `atob`/`btoa`, and a WebCrypto-shaped `crypto` global whose work is done
//! by a host [`webcrypto::CryptoProvider`].
//!
//! Entry point: [`ScriptRunner::run`].

#![forbid(unsafe_code)]
#![cfg_attr(
    test,
    allow(
        clippy::float_cmp,
        clippy::uninlined_format_args,
        clippy::missing_const_for_fn
    )
)]
#![allow(
    clippy::must_use_candidate,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::similar_names
)]

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod console;
pub mod crypto_module;
pub mod environment;
pub mod error;
pub mod keepalive;
pub mod key_registry;
pub mod marshal;
pub mod request;
pub mod runner;
pub mod test_tree;
pub mod webcrypto;

pub use config::SandboxConfig;
pub use error::{CryptoError, CryptoErrorKind, Error, Result, ScriptFailure};
pub use marshal::HostValue;
pub use runner::{ScriptInput, ScriptKind, ScriptOutcome, ScriptRunner};
pub use webcrypto::{CryptoProvider, NativeCrypto};
