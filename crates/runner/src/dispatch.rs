//! Engine selection.
//!
//! Picks the backend for a model before any runner state exists. Explicit
//! engine flags win; otherwise the model directory is classified by an ordered
//! list of filesystem checks, first match wins.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable forcing the AirLLM backend for any existing model path.
pub const AIRLLM_OVERRIDE_ENV: &str = "OLLAMA_USE_AIRLLM";

const SHARDED_INDEX: &str = "model.safetensors.index.json";
const WEIGHTS_EXTENSION: &str = "safetensors";
const MODEL_CONFIG: &str = "config.json";
const CONFIG_MARKERS: &[&str] = &["safetensors", "torch_dtype", "transformers"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// llama.cpp runner, used when nothing else matches
    #[default]
    Llama,
    Ollama,
    ImageGen,
    AirLlm,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Ollama => "ollama",
            Self::ImageGen => "imagegen",
            Self::AirLlm => "airllm",
        }
    }

    /// Backend named by an explicit engine flag.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "--ollama-engine" => Some(Self::Ollama),
            "--imagegen-engine" => Some(Self::ImageGen),
            "--airllm-engine" => Some(Self::AirLlm),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only view of the filesystem the classifier inspects.
pub trait ModelSource {
    fn exists(&self, path: &Path) -> bool;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSource;

impl ModelSource for DiskSource {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

type Rule = fn(&dyn ModelSource, &Path) -> bool;

/// Filesystem checks, in the order they are tried.
const RULES: &[(&str, Rule)] = &[
    ("sharded index", has_sharded_index),
    ("safetensors weights", has_weight_files),
    ("model config", config_has_marker),
];

fn has_sharded_index(source: &dyn ModelSource, dir: &Path) -> bool {
    source.exists(&dir.join(SHARDED_INDEX))
}

fn has_weight_files(source: &dyn ModelSource, dir: &Path) -> bool {
    source.list_dir(dir).is_ok_and(|entries| {
        entries
            .iter()
            .any(|p| p.extension().is_some_and(|ext| ext == WEIGHTS_EXTENSION))
    })
}

fn config_has_marker(source: &dyn ModelSource, dir: &Path) -> bool {
    source
        .read_to_string(&dir.join(MODEL_CONFIG))
        .is_ok_and(|content| {
            let content = content.to_lowercase();
            CONFIG_MARKERS.iter().any(|marker| content.contains(marker))
        })
}

fn is_affirmative(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

pub struct Classifier {
    source: Box<dyn ModelSource>,
    env_override: Option<String>,
}

impl Classifier {
    pub fn new(source: impl ModelSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            env_override: None,
        }
    }

    /// Disk-backed classifier reading the override from the environment.
    pub fn from_env() -> Self {
        Self::new(DiskSource).with_env_override(std::env::var(AIRLLM_OVERRIDE_ENV).ok())
    }

    pub fn with_env_override(mut self, value: Option<String>) -> Self {
        self.env_override = value;
        self
    }

    pub fn classify(&self, model_path: &str) -> Backend {
        if model_path.is_empty() {
            return Backend::default();
        }
        let dir = Path::new(model_path);
        if !self.source.exists(dir) {
            tracing::debug!(model_path, "Model path does not exist");
            return Backend::default();
        }

        for (rule, check) in RULES {
            if check(self.source.as_ref(), dir) {
                tracing::debug!(model_path, rule, "Model matched AirLLM check");
                return Backend::AirLlm;
            }
        }

        if self.env_override.as_deref().is_some_and(is_affirmative) {
            tracing::debug!(model_path, "AirLLM forced by {AIRLLM_OVERRIDE_ENV}");
            return Backend::AirLlm;
        }

        Backend::default()
    }
}

/// Chosen backend and the arguments to hand it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub backend: Backend,
    pub args: Vec<String>,
}

/// Choose a backend for a command line (without the program name).
pub fn select(args: &[String], classifier: &Classifier) -> Selection {
    let args = match args.first() {
        Some(first) if first == "runner" => &args[1..],
        _ => args,
    };

    if let Some(backend) = args.first().and_then(|a| Backend::from_flag(a)) {
        return Selection {
            backend,
            args: args[1..].to_vec(),
        };
    }

    let backend = model_path_arg(args)
        .map(|path| classifier.classify(path))
        .unwrap_or_default();
    Selection {
        backend,
        args: args.to_vec(),
    }
}

/// The model path on a command line: `--model <p>`, `--model=<p>` (or the
/// single-dash forms), else the first positional argument.
pub fn model_path_arg(args: &[String]) -> Option<&str> {
    let mut positional = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_str();
        if arg == "--model" || arg == "-model" {
            return iter.next().map(String::as_str);
        }
        if let Some(path) = arg
            .strip_prefix("--model=")
            .or_else(|| arg.strip_prefix("-model="))
        {
            return Some(path);
        }
        if crate::cli::takes_value(arg) {
            iter.next();
        } else if !arg.starts_with('-') && positional.is_none() {
            positional = Some(arg);
        }
    }
    positional
}
