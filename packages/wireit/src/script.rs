//! The script data model.
//!
//! A [`ScriptRef`] names a script; a [`ScriptConfig`] is the analyzer's
//! fully-resolved, immutable description of one. Configs form a DAG held by
//! shared ownership; dependency edges are plain refs into the executor's
//! memoization map, never direct pointers, so the data shape stays a DAG and
//! equality stays cheap.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::diagnostic::Location;

/// An absolute package directory plus a script name.
///
/// Equality is exact string equality of both fields; this is the key
/// identifying a script throughout the system.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ScriptRef {
    pub package: PathBuf,
    pub name: String,
}

impl ScriptRef {
    pub fn new(package: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    /// The canonical string form, used as a map key in fingerprints and
    /// memoization tables.
    pub fn label(&self) -> String {
        format!("{}:{}", self.package.display(), self.name)
    }

    /// Path to this script's package manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.package.join("package.json")
    }
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package.display(), self.name)
    }
}

/// When existing output is deleted relative to spawning and restoring.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum Clean {
    /// Delete before spawning and before restoring from cache.
    #[serde(rename = "true")]
    Always,
    /// Only delete before restoring from cache.
    #[serde(rename = "false")]
    Never,
    /// Delete before spawn if any previously-recorded input file no longer
    /// exists; always delete before restoring from cache.
    #[serde(rename = "if-file-deleted")]
    IfFileDeleted,
}

impl Default for Clean {
    fn default() -> Self {
        Clean::Always
    }
}

/// Rule determining when a service counts as started.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum ReadyWhen {
    /// Ready as soon as the child process spawns.
    Spawn,
    /// Ready when the first stdout/stderr line matches this pattern.
    LineMatches(String),
}

/// A dependency edge with its per-edge metadata.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Dependency {
    pub to: ScriptRef,
    /// Whether the dependent's fingerprint includes this dependency's
    /// fingerprint. Non-cascading edges establish ordering only.
    pub cascade: bool,
    /// Whether extra `--` args thread through this edge.
    pub pass_extra_args: bool,
    /// Where the specifier appears in the declaring manifest.
    pub location: Option<Location>,
}

/// How a script executes.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Execution {
    /// Exists only to group dependencies or aggregate files.
    NoCommand,
    /// Runs a command that is expected to exit on its own.
    OneShot { command: String },
    /// Runs a command that is expected not to exit on its own.
    Service {
        command: String,
        ready_when: ReadyWhen,
    },
}

/// A fully-resolved, immutable script configuration.
#[derive(Clone, Debug)]
pub struct ScriptConfig {
    pub script: ScriptRef,
    pub execution: Execution,
    pub dependencies: Vec<Dependency>,
    /// Input globs. `None` is distinct from empty: `None` means the inputs
    /// are not enumerated, so the script can never be fresh or cached.
    pub files: Option<Vec<String>>,
    /// Output globs. `None` means outputs are unknown; nothing is cached.
    pub output: Option<Vec<String>>,
    pub clean: Clean,
    /// Environment variable names whose values participate in the
    /// fingerprint, in declaration order.
    pub env: Vec<String>,
    /// Let globs reach into directories excluded by default
    /// (`node_modules`, `.git`, ...).
    pub allow_usually_excluded_paths: bool,
    /// Effective service dependencies: direct service deps unioned with the
    /// effective service deps of every non-service dependency.
    pub service_deps: Vec<ScriptRef>,
    /// Extra args threaded from the invocation, if this script opted in.
    pub extra_args: Option<Vec<String>>,
    /// Whether the user asked for this script (vs. transitively required).
    /// Controls service teardown: directly-invoked services persist until
    /// abort.
    pub directly_invoked: bool,
    /// The manifest that declared this script.
    pub declaring_file: PathBuf,
    /// Range of the `wireit[name]` config object, for diagnostics.
    pub config_location: Option<Location>,
}

impl ScriptConfig {
    pub fn command(&self) -> Option<&str> {
        match &self.execution {
            Execution::NoCommand => None,
            Execution::OneShot { command } | Execution::Service { command, .. } => Some(command),
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self.execution, Execution::Service { .. })
    }

    pub fn package(&self) -> &Path {
        &self.script.package
    }

    /// Cascading dependency edges, the ones whose fingerprints feed ours.
    pub fn cascading_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|dep| dep.cascade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ref_equality_is_exact_string_equality() {
        let a = ScriptRef::new("/repo/pkg", "build");
        let b = ScriptRef::new("/repo/pkg", "build");
        let c = ScriptRef::new("/repo/pkg2", "build");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.label(), "/repo/pkg:build");
    }

    #[test]
    fn clean_serializes_to_manifest_literals() {
        assert_eq!(serde_json::to_string(&Clean::Always).unwrap(), r#""true""#);
        assert_eq!(serde_json::to_string(&Clean::Never).unwrap(), r#""false""#);
        assert_eq!(
            serde_json::to_string(&Clean::IfFileDeleted).unwrap(),
            r#""if-file-deleted""#
        );
    }
}
