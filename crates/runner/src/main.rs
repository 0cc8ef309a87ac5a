use std::process;
use std::sync::Arc;

use airllm_runner::{RunnerConfig, RunnerService, ServerConfig};
use runner::cli::USAGE;
use runner::{Backend, Classifier, CliError, RunnerArgs, select};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    init_tracing(wants_verbose(&args));

    let selection = select(&args, &Classifier::from_env());
    tracing::debug!(backend = %selection.backend, "Selected engine");

    if selection.backend != Backend::AirLlm {
        eprintln!(
            "error: {} engine not available in this build",
            selection.backend
        );
        process::exit(2);
    }

    let runner_args = match RunnerArgs::parse(&selection.args) {
        Ok(args) => args,
        Err(CliError::Help) => {
            eprint!("{USAGE}");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprint!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(runner_args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(args: RunnerArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let service = Arc::new(RunnerService::new(
            RunnerConfig::new()
                .with_model_path(args.model)
                .with_worker_port(args.worker_port),
        ));
        let config = ServerConfig {
            port: args.port,
            ..ServerConfig::default()
        };
        airllm_runner::serve(config, service).await
    })
}

/// Debug logging requested on the command line or through `OLLAMA_DEBUG`.
fn wants_verbose(args: &[String]) -> bool {
    args.iter().any(|a| a == "--verbose" || a == "-verbose")
        || std::env::var("OLLAMA_DEBUG").is_ok_and(|v| !v.is_empty() && v != "0" && v != "false")
}

/// `RUST_LOG` wins when set; otherwise our crates log at info, or debug when
/// verbose. `LOG_FORMAT=json` switches to JSON lines. Always to stderr.
fn init_tracing(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("airllm_runner={level},runner={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
