//! Glob expansion for input and output sets.
//!
//! Resolves a list of glob patterns relative to a package directory into a
//! deterministic list of absolute entries with file type metadata. Negation
//! (`!`) semantics are order-sensitive: a later pattern can re-add or
//! re-remove entries, so matching walks the pattern list and lets the last
//! match win. Dotfiles are matched. Symlinks are reported as symlinks and
//! never followed during the walk.
//!
//! A pattern that matches a directory matches the directory's whole subtree
//! (until a later negation removes part of it again).

use std::path::{Component, Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// Directory names that globs skip unless the script opts in with
/// `allowUsuallyExcludedPaths`.
pub const USUALLY_EXCLUDED: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".wireit",
    ".yarn",
    "CVS",
    "node_modules",
];

/// The file type of a matched entry, read without following symlinks.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One matched filesystem entry.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GlobEntry {
    /// Absolute path of the entry.
    pub path: PathBuf,
    pub kind: EntryKind,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct GlobOptions {
    /// Match inside the `USUALLY_EXCLUDED` directories too.
    pub allow_usually_excluded_paths: bool,
    /// Treat a pattern matching a directory as matching its whole subtree.
    /// Input and output sets want this; workspace expansion wants exact
    /// directory matches only.
    pub expand_directories: bool,
}

impl Default for GlobOptions {
    fn default() -> Self {
        Self {
            allow_usually_excluded_paths: false,
            expand_directories: true,
        }
    }
}

struct Pattern {
    negated: bool,
    matcher: GlobMatcher,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|raw| {
            let (negated, text) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw.as_str()),
            };
            let matcher = GlobBuilder::new(text)
                .literal_separator(true)
                .backslash_escape(true)
                .build()
                .with_context(|| format!("invalid glob pattern: {raw:?}"))?
                .compile_matcher();
            Ok(Pattern { negated, matcher })
        })
        .collect()
}

/// Report whether `rel` (or any of its ancestors) matches the pattern.
///
/// Matching ancestors is what makes a bare directory pattern cover its
/// subtree.
fn matches_self_or_ancestor(pattern: &Pattern, rel: &Path) -> bool {
    if pattern.matcher.is_match(rel) {
        return true;
    }
    let mut ancestor = rel.parent();
    while let Some(current) = ancestor {
        if current.as_os_str().is_empty() {
            break;
        }
        if pattern.matcher.is_match(current) {
            return true;
        }
        ancestor = current.parent();
    }
    false
}

/// Resolve glob `patterns` relative to `cwd` into a deterministic list of
/// absolute entries. Entries come back in walk order (parents before
/// children, siblings sorted by name).
#[instrument(skip(patterns))]
pub async fn resolve(
    cwd: &Path,
    patterns: &[String],
    options: GlobOptions,
) -> Result<Vec<GlobEntry>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let compiled = compile(patterns)?;
    let cwd = cwd.to_path_buf();

    let entries = spawn_blocking(move || -> Result<Vec<GlobEntry>> {
        let mut out = Vec::new();
        let walker = WalkDir::new(&cwd)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if options.allow_usually_excluded_paths || entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !USUALLY_EXCLUDED.contains(&name.as_ref())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // A file disappearing mid-walk is routine during concurrent
                // builds; skip it rather than failing the whole expansion.
                Err(err) if err.io_error().is_some_and(is_not_found) => continue,
                Err(err) => return Err(err).with_context(|| format!("walk files in {cwd:?}")),
            };
            if entry.depth() == 0 {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&cwd)
                .context("strip walk root prefix")?;

            let mut included = false;
            for pattern in &compiled {
                let matched = if options.expand_directories {
                    matches_self_or_ancestor(pattern, rel)
                } else {
                    pattern.matcher.is_match(rel)
                };
                if matched {
                    included = !pattern.negated;
                }
            }
            if !included {
                continue;
            }

            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            out.push(GlobEntry {
                path: entry.path().to_path_buf(),
                kind,
            });
        }
        Ok(out)
    })
    .await
    .context("join task")??;

    trace!(matched = entries.len(), "resolved globs");
    Ok(entries)
}

fn is_not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

/// Check that a pattern compiles, without resolving anything. Lets the
/// analyzer reject bad patterns with a source location instead of failing
/// later mid-fingerprint.
pub fn validate(pattern: &str) -> Result<()> {
    let text = pattern.strip_prefix('!').unwrap_or(pattern);
    GlobBuilder::new(text)
        .literal_separator(true)
        .backslash_escape(true)
        .build()
        .with_context(|| format!("invalid glob pattern: {pattern:?}"))?;
    Ok(())
}

/// Verify that every pattern stays inside `cwd` once resolved.
///
/// The check is lexical: the literal prefix of the pattern (everything up to
/// the first glob metacharacter) is joined to `cwd` and normalized; if the
/// result escapes `cwd`, that's a configuration error. This runs before any
/// deletion so that a misdeclared `output` can never touch outside files.
pub fn ensure_inside(cwd: &Path, pattern: &str) -> Result<()> {
    let text = pattern.strip_prefix('!').unwrap_or(pattern);
    let literal: String = text
        .chars()
        .take_while(|c| !matches!(c, '*' | '?' | '[' | '{'))
        .collect();

    let candidate = normalize_lexically(&cwd.join(&literal));
    let base = normalize_lexically(cwd);
    if !candidate.starts_with(&base) {
        bail!("glob pattern {pattern:?} resolves outside of the package directory");
    }
    Ok(())
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
