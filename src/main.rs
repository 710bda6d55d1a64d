//! hopp-sandbox CLI binary.

use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use hopp_sandbox::cli::{Cli, Commands};
use hopp_sandbox::{NativeCrypto, SandboxConfig, ScriptInput, ScriptRunner};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match main_impl() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn main_impl() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = SandboxConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            script,
            request,
            env,
            response,
            kind,
        } => {
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("Failed to read script {}", script.display()))?;
            let mut input = ScriptInput::new(kind.into(), source);
            if let Some(path) = request.as_deref() {
                input = input.with_request(read_json(path)?);
            }
            if let Some(path) = env.as_deref() {
                input = input.with_environment(read_json(path)?);
            }
            if let Some(path) = response.as_deref() {
                input = input.with_response(read_json(path)?);
            }

            let runner = ScriptRunner::new(config, Some(Arc::new(NativeCrypto::new())));
            match runner.run(input) {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => {
                    let report = serde_json::json!({
                        "error": failure.to_string(),
                        "consoleEntries": failure.console_entries,
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
