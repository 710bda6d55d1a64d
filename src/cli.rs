//! CLI argument parsing using Clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::runner::ScriptKind;

/// hopp-sandbox - run request scripts in a QuickJS sandbox
#[derive(Parser, Debug)]
#[command(name = "hopp-sandbox")]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:
  hopp-sandbox run --script pre.js --request req.json --env env.json
  hopp-sandbox run --kind test --script test.js --response res.json
")]
pub struct Cli {
    /// Sandbox config file (JSON); HOPP_SANDBOX_* variables override it
    #[arg(long, global = true, env = "HOPP_SANDBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one script and print the outcome as JSON
    Run {
        /// Script file to execute
        #[arg(long)]
        script: PathBuf,

        /// Request snapshot (JSON)
        #[arg(long)]
        request: Option<PathBuf>,

        /// Environments `{ "global": [...], "selected": [...] }` (JSON)
        #[arg(long)]
        env: Option<PathBuf>,

        /// Response snapshot for test scripts (JSON)
        #[arg(long)]
        response: Option<PathBuf>,

        /// Which hook the script runs as
        #[arg(long, value_enum, default_value_t = KindArg::Pre)]
        kind: KindArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    Pre,
    Test,
}

impl From<KindArg> for ScriptKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Pre => Self::PreRequest,
            KindArg::Test => Self::Test,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_to_pre_request() {
        let cli = Cli::parse_from(["hopp-sandbox", "run", "--script", "a.js"]);
        let Commands::Run {
            script,
            request,
            kind,
            ..
        } = cli.command;
        assert_eq!(script, PathBuf::from("a.js"));
        assert!(request.is_none());
        assert_eq!(ScriptKind::from(kind), ScriptKind::PreRequest);
    }

    #[test]
    fn parses_test_kind_and_inputs() {
        let cli = Cli::parse_from([
            "hopp-sandbox",
            "run",
            "--kind",
            "test",
            "--script",
            "t.js",
            "--response",
            "res.json",
            "--config",
            "sandbox.json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("sandbox.json")));
        let Commands::Run { kind, response, .. } = cli.command;
        assert_eq!(kind, KindArg::Test);
        assert_eq!(response, Some(PathBuf::from("res.json")));
    }

    #[test]
    fn rejects_unknown_kind() {
        let result = Cli::try_parse_from(["hopp-sandbox", "run", "--script", "a.js", "--kind", "post"]);
        assert!(result.is_err());
    }
}
