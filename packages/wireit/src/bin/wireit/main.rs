//! The binary entrypoint for `wireit`, the incremental script runner.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::{Parser, crate_version};
use color_eyre::{Result, eyre::Context};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::util::SubscriberInitExt;

use wireit::{
    engine::{Engine, EngineOptions, RunOutcome},
    event,
    script::ScriptRef,
};

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod log;
mod logger;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USER_FAILURE: i32 = 1;
const EXIT_BUG: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "wireit",
    about = "Incremental script runner for package manifests",
    version = crate_version!(),
)]
struct TopLevelFlags {
    /// Script to run. Defaults to the package manager's lifecycle event
    /// (`npm_lifecycle_event`) when invoked through `npm run`.
    script: Option<String>,

    /// Re-run whenever input files or manifests change.
    #[arg(long)]
    watch: bool,

    /// Arguments after `--`, forwarded to scripts that opt in.
    #[arg(last = true)]
    extra_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    if let Err(err) = color_eyre::install() {
        eprintln!("wireit: {err}");
        return EXIT_BUG;
    }
    let top = TopLevelFlags::parse();

    match log::make_logger(std::io::stderr) {
        Ok(logger) => logger.init(),
        Err(err) => {
            eprintln!("wireit: failed to set up logging: {err}");
            return EXIT_BUG;
        }
    }

    let options = match EngineOptions::from_environment() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("wireit: {err:#}");
            return EXIT_USER_FAILURE;
        }
    };
    let logger_mode = match std::env::var("WIREIT_LOGGER")
        .ok()
        .filter(|value| !value.is_empty())
        .map(|value| value.parse::<logger::Mode>())
        .transpose()
    {
        Ok(mode) => mode.unwrap_or_default(),
        Err(err) => {
            eprintln!("wireit: invalid WIREIT_LOGGER: {err:#}");
            return EXIT_USER_FAILURE;
        }
    };

    let root = match resolve_root(&top) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("wireit: {err:#}");
            return EXIT_USER_FAILURE;
        }
    };

    // Ctrl-C cancels cooperatively; the engine kills children with
    // escalation and returns in bounded time.
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::Relaxed);
                cancel.cancel();
            }
        });
    }

    let (events, receiver) = event::channel();
    let logger_task = tokio::spawn(logger::run(receiver, logger_mode));

    let engine = Engine::new(options, events);
    let outcome = if top.watch {
        engine
            .watch(&root, &top.extra_args, cancel.clone())
            .await
            .map(|()| RunOutcome::Success)
    } else {
        engine.run(&root, &top.extra_args, cancel.clone()).await
    };

    // Dropping the engine drops the last event sender, letting the logger
    // drain and exit.
    drop(engine);
    let _ = logger_task.await;

    match outcome {
        Ok(_) if interrupted.load(Ordering::Relaxed) => EXIT_INTERRUPTED,
        Ok(RunOutcome::Success) => EXIT_SUCCESS,
        Ok(RunOutcome::KnownFailure) => EXIT_USER_FAILURE,
        Ok(RunOutcome::UnexpectedFailure) => EXIT_BUG,
        Err(err) => {
            eprintln!("wireit: unexpected error: {err:?}");
            EXIT_BUG
        }
    }
}

/// Resolve the script ref to run: the positional argument or the package
/// manager's lifecycle event, in the package named by the package manager
/// (or the current directory).
fn resolve_root(top: &TopLevelFlags) -> Result<ScriptRef> {
    let name = match &top.script {
        Some(name) => name.clone(),
        None => std::env::var("npm_lifecycle_event").context(
            "no script specified: pass a script name, or run through your package manager",
        )?,
    };

    let package = match std::env::var("npm_config_local_prefix") {
        Ok(prefix) if !prefix.is_empty() => prefix.into(),
        _ => std::env::current_dir().context("determine current directory")?,
    };
    let package = std::path::absolute(&package)
        .with_context(|| format!("make package path absolute: {package:?}"))?;

    Ok(ScriptRef::new(package, name))
}
