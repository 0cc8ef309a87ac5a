//! Command line for the AirLLM engine.

use crate::error::{CliError, Result};

pub const DEFAULT_PORT: u16 = 8080;

pub const USAGE: &str = "\
Usage: runner [runner] [--airllm-engine] [--model <path> | <path>] [--port <n>] [--worker-port <n>] [--verbose]

Options:
  --model <path>       Model directory
  --port <n>           Port for the runner API [default: 8080]
  --worker-port <n>    Port for the Python worker [default: any free port]
  --verbose            Debug logging
";

/// Flags that consume the following argument.
const VALUE_FLAGS: &[&str] = &["model", "port", "worker-port"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerArgs {
    pub model: String,
    pub port: u16,
    pub worker_port: Option<u16>,
    pub verbose: bool,
}

impl Default for RunnerArgs {
    fn default() -> Self {
        Self {
            model: String::new(),
            port: DEFAULT_PORT,
            worker_port: None,
            verbose: false,
        }
    }
}

/// Flag name with one or two leading dashes removed.
fn flag_name(arg: &str) -> Option<&str> {
    arg.strip_prefix("--")
        .or_else(|| arg.strip_prefix('-'))
        .filter(|name| !name.is_empty())
}

/// Whether `arg` is a flag whose value is the next argument.
pub fn takes_value(arg: &str) -> bool {
    flag_name(arg).is_some_and(|name| VALUE_FLAGS.contains(&name))
}

fn parse_port(flag: &str, value: &str) -> Result<u16> {
    value.parse().map_err(|e: std::num::ParseIntError| CliError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

impl RunnerArgs {
    /// Parse engine arguments (program name and engine flag already removed).
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = Self::default();
        let mut positional: Option<String> = None;

        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            let Some(name) = flag_name(arg) else {
                if positional.is_some() {
                    return Err(CliError::UnexpectedArgument(arg.to_string()));
                }
                positional = Some(arg.to_string());
                i += 1;
                continue;
            };

            let (name, inline) = match name.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (name, None),
            };

            let value = if VALUE_FLAGS.contains(&name) {
                match inline {
                    Some(value) => Some(value.to_string()),
                    None => {
                        i += 1;
                        Some(
                            args.get(i)
                                .ok_or_else(|| CliError::MissingValue(format!("--{name}")))?
                                .clone(),
                        )
                    }
                }
            } else {
                None
            };

            match (name, value) {
                ("model", Some(value)) => parsed.model = value,
                ("port", Some(value)) => parsed.port = parse_port("--port", &value)?,
                ("worker-port", Some(value)) => {
                    parsed.worker_port = Some(parse_port("--worker-port", &value)?)
                }
                ("verbose", None) if inline.is_none() => parsed.verbose = true,
                ("help" | "h", None) => return Err(CliError::Help),
                _ => return Err(CliError::UnknownFlag(arg.to_string())),
            }
            i += 1;
        }

        if parsed.model.is_empty()
            && let Some(model) = positional
        {
            parsed.model = model;
        }
        Ok(parsed)
    }
}
