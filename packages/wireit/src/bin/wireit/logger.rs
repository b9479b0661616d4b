//! The console subscriber for the engine's event stream.
//!
//! Deliberately thin: the fancy terminal presentation is out of scope for
//! the engine, so this prints one line per lifecycle event and passes
//! script output through verbatim.

use std::{
    collections::BTreeMap,
    io::Write as _,
    str::FromStr,
};

use color_eyre::eyre::bail;
use wireit::event::{Event, EventReceiver, InfoDetail, OutputStream};

/// Recognized `WIREIT_LOGGER` values.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Mode {
    #[default]
    Default,
    Quiet,
    QuietCi,
    Metrics,
    Debug,
}

impl FromStr for Mode {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Mode::Default),
            "quiet" => Ok(Mode::Quiet),
            "quiet-ci" => Ok(Mode::QuietCi),
            "metrics" => Ok(Mode::Metrics),
            "debug" => Ok(Mode::Debug),
            other => bail!(
                "expected \"default\", \"quiet\", \"quiet-ci\", \"metrics\", or \"debug\", \
                 got {other:?}"
            ),
        }
    }
}

/// Drain the event stream until the engine drops its sender.
pub async fn run(mut events: EventReceiver, mode: Mode) {
    let mut successes: BTreeMap<String, usize> = BTreeMap::new();
    let mut failures = 0usize;

    while let Some(event) = events.recv().await {
        match &event {
            Event::Output { stream, chunk, .. } => match stream {
                OutputStream::Stdout => {
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(chunk);
                    let _ = stdout.flush();
                }
                OutputStream::Stderr => {
                    let mut stderr = std::io::stderr().lock();
                    let _ = stderr.write_all(chunk);
                    let _ = stderr.flush();
                }
            },
            Event::Success { script, reason } => {
                *successes.entry(reason.to_string()).or_default() += 1;
                if matches!(mode, Mode::Default | Mode::Debug) {
                    eprintln!("[{}] {reason}", script.name);
                }
            }
            Event::Failure {
                script,
                reason,
                message,
                diagnostic,
            } => {
                failures += 1;
                eprintln!("[{}] failed: {reason}: {message}", script.name);
                if let Some(diagnostic) = diagnostic {
                    eprintln!("{diagnostic}");
                }
            }
            Event::UnexpectedError { script, message } => {
                failures += 1;
                eprintln!("[{}] unexpected error: {message}", script.name);
            }
            Event::Info { script, detail } => match detail {
                InfoDetail::Running { command } if matches!(mode, Mode::Default | Mode::Debug) => {
                    eprintln!("[{}] running: {command}", script.name);
                }
                InfoDetail::Locked { lock } => {
                    eprintln!(
                        "[{}] waiting for another invocation holding {}",
                        script.name,
                        lock.display()
                    );
                }
                detail if mode == Mode::Debug => {
                    eprintln!("[{}] {detail:?}", script.name);
                }
                _ => {}
            },
        }
    }

    if mode == Mode::Metrics {
        eprintln!("wireit metrics:");
        for (reason, count) in &successes {
            eprintln!("  {reason}: {count}");
        }
        eprintln!("  failures: {failures}");
    }
}
