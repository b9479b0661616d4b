//! The engine façade: everything one invocation needs, wired together from
//! constructor-injected options.
//!
//! There is no module-scope state anywhere in this crate: failure mode,
//! parallelism, cache backend choice, and the file-descriptor budget all
//! arrive here, parsed once from the environment by the binary.

use std::str::FromStr;

use color_eyre::{Result, eyre::{Context, bail}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    analyzer::Analyzer,
    cache::{Cache, GithubCache, LocalCache},
    event::EventSender,
    executor::{ExecuteOptions, Executor, FailureKind, FailureMode, Parallelism},
    fs::{DEFAULT_MAX_OPEN_FILES, Fs},
    manifest::ManifestReader,
    script::ScriptRef,
    service::ServiceSupervisor,
    watcher::{self, WatchOptions},
};

/// Which cache backend to use.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum CacheChoice {
    #[default]
    Local,
    Github,
    None,
}

impl FromStr for CacheChoice {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(CacheChoice::Local),
            "github" => Ok(CacheChoice::Github),
            "none" => Ok(CacheChoice::None),
            other => bail!("expected \"local\", \"github\", or \"none\", got {other:?}"),
        }
    }
}

impl FromStr for FailureMode {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no-new" => Ok(FailureMode::NoNew),
            "continue" => Ok(FailureMode::Continue),
            "kill" => Ok(FailureMode::Kill),
            other => bail!("expected \"no-new\", \"continue\", or \"kill\", got {other:?}"),
        }
    }
}

/// All the knobs one invocation runs with.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub failure_mode: FailureMode,
    pub parallelism: Parallelism,
    pub cache: CacheChoice,
    pub max_open_files: usize,
    pub custodian_port: Option<u16>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            parallelism: Parallelism::default(),
            cache: CacheChoice::default(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            custodian_port: None,
        }
    }
}

impl EngineOptions {
    /// Parse the recognized `WIREIT_*` environment variables.
    pub fn from_environment() -> Result<Self> {
        let failure_mode = match read_env("WIREIT_FAILURES") {
            None => FailureMode::default(),
            Some(value) => value.parse().context("parse WIREIT_FAILURES")?,
        };

        let parallelism = match read_env("WIREIT_PARALLEL") {
            // Empty/unset means the default bound.
            None => Parallelism::default(),
            Some(value) if value.eq_ignore_ascii_case("infinity") => Parallelism::Unbounded,
            Some(value) => {
                let limit: usize = value
                    .parse()
                    .context("parse WIREIT_PARALLEL as a positive integer")?;
                if limit == 0 {
                    bail!("WIREIT_PARALLEL must be positive");
                }
                Parallelism::Bounded(limit)
            }
        };

        let cache = match read_env("WIREIT_CACHE") {
            None => CacheChoice::default(),
            Some(value) => value.parse().context("parse WIREIT_CACHE")?,
        };

        let max_open_files = match read_env("WIREIT_MAX_OPEN_FILES") {
            None => DEFAULT_MAX_OPEN_FILES,
            Some(value) => value
                .parse()
                .context("parse WIREIT_MAX_OPEN_FILES as an integer")?,
        };

        let custodian_port = match read_env("WIREIT_CACHE_GITHUB_CUSTODIAN_PORT") {
            None => None,
            Some(value) => Some(
                value
                    .parse()
                    .context("parse WIREIT_CACHE_GITHUB_CUSTODIAN_PORT as a port")?,
            ),
        };

        Ok(Self {
            failure_mode,
            parallelism,
            cache,
            max_open_files,
            custodian_port,
        })
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// The user-facing outcome of one invocation, mapped to an exit code by the
/// binary: success 0, known failure 1, unexpected failure 2.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunOutcome {
    Success,
    KnownFailure,
    UnexpectedFailure,
}

pub struct Engine {
    fs: Fs,
    analyzer: Analyzer,
    events: EventSender,
    options: EngineOptions,
}

impl Engine {
    pub fn new(options: EngineOptions, events: EventSender) -> Self {
        let fs = Fs::new(options.max_open_files);
        let analyzer = Analyzer::new(ManifestReader::new(fs.clone()), fs.clone());
        Self {
            fs,
            analyzer,
            events,
            options,
        }
    }

    async fn cache(&self) -> Result<Option<Cache>> {
        match self.options.cache {
            CacheChoice::None => Ok(None),
            CacheChoice::Local => Ok(Some(Cache::Local(LocalCache::new(self.fs.clone())))),
            CacheChoice::Github => {
                match GithubCache::from_environment(self.fs.clone(), self.options.custodian_port)
                    .await?
                {
                    Some(cache) => Ok(Some(Cache::Github(cache))),
                    None => {
                        warn!("github cache requested but no credentials found; caching disabled");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            failure_mode: self.options.failure_mode,
            parallelism: self.options.parallelism,
            failed_previously: Default::default(),
        }
    }

    /// Run `root` once.
    #[instrument(skip_all, fields(%root))]
    pub async fn run(
        &self,
        root: &ScriptRef,
        extra_args: &[String],
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let graph = match self.analyzer.analyze(root, extra_args).await? {
            Ok(graph) => graph,
            Err(failure) => {
                for diagnostic in &failure.diagnostics {
                    self.events
                        .failure_diagnostic(root, failure.reason, diagnostic.clone());
                }
                return Ok(RunOutcome::KnownFailure);
            }
        };
        for warning in &graph.warnings {
            warn!(%warning, "analysis warning");
        }

        let cache = self.cache().await?;
        let supervisor = ServiceSupervisor::new(self.events.clone(), cancel.child_token());
        let executor = Executor::new(
            graph.clone(),
            self.fs.clone(),
            cache,
            self.events.clone(),
            supervisor,
            self.execute_options(),
            cancel.clone(),
        );

        let result = executor.execute(root).await;

        // A directly-invoked service persists until abort (or until it
        // exits by itself, which is a failure).
        let mut service_failed = false;
        if result.is_ok()
            && graph.get(root).is_some_and(|config| config.is_service())
            && let Some(record) = executor.supervisor().get(root)
        {
            executor.supervisor().detach(root);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = record.wait_terminated() => {
                    service_failed =
                        record.state() == crate::service::ServiceState::Failed;
                }
            }
        }

        executor.supervisor().shutdown_all().await;
        debug!("invocation complete");

        if executor
            .failures()
            .iter()
            .any(|failure| failure.kind == FailureKind::Unexpected)
        {
            return Ok(RunOutcome::UnexpectedFailure);
        }
        match result {
            Ok(_) if !service_failed => Ok(RunOutcome::Success),
            _ => Ok(RunOutcome::KnownFailure),
        }
    }

    /// Run `root` under the watch loop until abort.
    #[instrument(skip_all, fields(%root))]
    pub async fn watch(
        &self,
        root: &ScriptRef,
        extra_args: &[String],
        cancel: CancellationToken,
    ) -> Result<()> {
        let cache = self.cache().await?;
        watcher::watch(
            &self.analyzer,
            &self.fs,
            cache,
            &self.events,
            root,
            extra_args,
            WatchOptions {
                execute: self.execute_options(),
            },
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cache_choice_parses() {
        assert_eq!("local".parse::<CacheChoice>().unwrap(), CacheChoice::Local);
        assert_eq!("github".parse::<CacheChoice>().unwrap(), CacheChoice::Github);
        assert_eq!("none".parse::<CacheChoice>().unwrap(), CacheChoice::None);
        assert!("remote".parse::<CacheChoice>().is_err());
    }

    #[test]
    fn failure_mode_parses() {
        assert_eq!("no-new".parse::<FailureMode>().unwrap(), FailureMode::NoNew);
        assert_eq!(
            "continue".parse::<FailureMode>().unwrap(),
            FailureMode::Continue
        );
        assert_eq!("kill".parse::<FailureMode>().unwrap(), FailureMode::Kill);
        assert!("stop".parse::<FailureMode>().is_err());
    }
}
