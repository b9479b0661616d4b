//! Manifest analysis: validate script declarations and resolve them into a
//! typed, acyclic graph of immutable script configs.
//!
//! Analysis runs in three passes:
//! 1. *Collect*: starting from the root package, read every reachable
//!    manifest and parse its `scripts`/`wireit` sections into raw per-script
//!    declarations, expanding `$WORKSPACES` specifiers into concrete package
//!    directories along the way.
//! 2. *Resolve*: turn each raw dependency specifier into concrete edges,
//!    now that every reachable manifest is in memory.
//! 3. *Build*: depth-first walk from the root with an active-ancestry set
//!    for cycle detection, producing memoized configs and each node's
//!    effective service dependencies.
//!
//! Failures are diagnostics, collected rather than thrown; analysis returns
//! every problem it can find. Unexpected I/O failures stay on the `Result`
//! channel.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use color_eyre::Result;
use tracing::{debug, instrument};

use crate::{
    diagnostic::{Diagnostic, Location, SourceRange},
    event::FailureReason,
    fs::Fs,
    glob::{self, EntryKind, GlobOptions},
    manifest::{Manifest, ManifestFile, ManifestReader, SpannedKind, SpannedValue},
    script::{Clean, Dependency, Execution, ReadyWhen, ScriptConfig, ScriptRef},
};

/// A validated, acyclic script graph rooted at one script.
#[derive(Clone, Debug)]
pub struct ScriptGraph {
    pub root: ScriptRef,
    pub scripts: HashMap<ScriptRef, Arc<ScriptConfig>>,
    /// Non-fatal diagnostics encountered during analysis.
    pub warnings: Vec<Diagnostic>,
}

impl ScriptGraph {
    pub fn get(&self, script: &ScriptRef) -> Option<&Arc<ScriptConfig>> {
        self.scripts.get(script)
    }

    /// Every manifest file reachable from the root, for watch registration.
    pub fn manifests(&self) -> BTreeSet<PathBuf> {
        self.scripts
            .keys()
            .map(ScriptRef::manifest_path)
            .collect()
    }
}

/// Why analysis failed, with everything wrong that was found.
#[derive(Clone, Debug)]
pub struct AnalysisFailure {
    pub reason: FailureReason,
    pub diagnostics: Vec<Diagnostic>,
}

pub type AnalyzeResult = std::result::Result<ScriptGraph, AnalysisFailure>;

#[derive(Clone, Debug)]
pub struct Analyzer {
    reader: ManifestReader,
    fs: Fs,
}

impl Analyzer {
    pub fn new(reader: ManifestReader, fs: Fs) -> Self {
        Self { reader, fs }
    }

    pub fn reader(&self) -> &ManifestReader {
        &self.reader
    }

    /// Analyze the graph rooted at `root`. Idempotent while the manifest
    /// cache is valid; watch mode invalidates the cache before retrying.
    #[instrument(skip(self, extra_args))]
    pub async fn analyze(&self, root: &ScriptRef, extra_args: &[String]) -> Result<AnalyzeResult> {
        let mut analysis = Analysis {
            analyzer: self,
            packages: HashMap::new(),
            diagnostics: Vec::new(),
            saw_cycle: false,
        };
        analysis.collect(root.package.clone()).await?;
        let result = analysis.build(root, extra_args).await?;
        Ok(result)
    }
}

/// A raw dependency specifier, not yet resolved to package directories.
#[derive(Clone, Debug)]
struct RawDependency {
    specifier: String,
    cascade: bool,
    pass_extra_args: bool,
    range: SourceRange,
}

/// One script's declaration, validated for shape but with unresolved
/// dependency specifiers.
#[derive(Clone, Debug)]
struct RawScript {
    execution: Execution,
    dependencies: Vec<RawDependency>,
    files: Option<Vec<String>>,
    output: Option<Vec<String>>,
    clean: Clean,
    env: Vec<String>,
    allow_usually_excluded_paths: bool,
    config_range: SourceRange,
}

/// A package's parsed manifest contents.
#[derive(Debug)]
struct PackageScripts {
    /// Script name -> raw declaration. Includes plain (non-wireit) scripts,
    /// which become standard scripts with no declared files or output.
    /// `None` marks a script that is declared but misconfigured; its
    /// diagnostics are already recorded.
    scripts: HashMap<String, Option<RawScript>>,
    workspaces: Option<Vec<String>>,
}

impl PackageScripts {
    fn empty() -> Self {
        Self {
            scripts: HashMap::new(),
            workspaces: None,
        }
    }
}

enum Node {
    InProgress,
    Done(Option<Arc<ScriptConfig>>),
}

struct Analysis<'a> {
    analyzer: &'a Analyzer,
    packages: HashMap<PathBuf, PackageScripts>,
    diagnostics: Vec<Diagnostic>,
    saw_cycle: bool,
}

impl Analysis<'_> {
    /// Pass 1: read every reachable manifest, breadth-first.
    async fn collect(&mut self, root_package: PathBuf) -> Result<()> {
        let mut queue = VecDeque::from([root_package]);
        while let Some(package) = queue.pop_front() {
            if self.packages.contains_key(&package) {
                continue;
            }
            let parsed = self.read_package(&package).await?;

            // Discover referenced packages before storing.
            for raw in parsed.scripts.values().flatten() {
                for dep in &raw.dependencies {
                    if let Some(rest) = dep.specifier.strip_prefix("$WORKSPACES") {
                        if !(rest.is_empty() || rest.starts_with(':')) {
                            continue;
                        }
                        let Some(patterns) = parsed.workspaces.clone() else {
                            continue;
                        };
                        for dir in self.workspace_dirs(&package, &patterns).await? {
                            // A workspace glob can match directories that
                            // aren't packages at all; those are silently
                            // omitted rather than diagnosed.
                            if self.analyzer.fs.exists(dir.join("package.json")).await {
                                queue.push_back(dir);
                            }
                        }
                    } else if dep.specifier.starts_with("./") || dep.specifier.starts_with("../") {
                        let path_part = dep
                            .specifier
                            .rsplit_once(':')
                            .map(|(path, _)| path)
                            .unwrap_or(&dep.specifier);
                        queue.push_back(normalize(&package.join(path_part)));
                    }
                }
            }
            self.packages.insert(package, parsed);
        }
        Ok(())
    }

    /// Resolve a package's `workspaces` globs to concrete directories.
    async fn workspace_dirs(&self, package: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let entries = glob::resolve(
            package,
            patterns,
            GlobOptions {
                allow_usually_excluded_paths: false,
                expand_directories: false,
            },
        )
        .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Dir)
            .map(|entry| normalize(&entry.path))
            .collect())
    }

    async fn read_package(&mut self, package: &Path) -> Result<PackageScripts> {
        let manifest_path = package.join("package.json");
        match self.analyzer.reader.read(&manifest_path).await? {
            ManifestFile::Missing => {
                self.diagnostics.push(Diagnostic::error(
                    format!("no package.json found in {}", package.display()),
                    None,
                ));
                Ok(PackageScripts::empty())
            }
            ManifestFile::Invalid(diagnostic) => {
                self.diagnostics.push((*diagnostic).clone());
                Ok(PackageScripts::empty())
            }
            ManifestFile::Parsed(manifest) => Ok(self.parse_package(manifest)),
        }
    }

    /// Validate the shape of one manifest's `scripts` and `wireit` sections.
    fn parse_package(&mut self, manifest: Arc<Manifest>) -> PackageScripts {
        let mut out = PackageScripts {
            scripts: HashMap::new(),
            workspaces: None,
        };
        let root = &manifest.root;
        if root.as_object().is_none() {
            self.diagnostics.push(Diagnostic::error(
                format!("expected an object, got {}", root.type_name()),
                manifest.location(root.range),
            ));
            return out;
        }

        // scripts: object of name -> shell string.
        let mut script_commands: HashMap<String, (String, SourceRange)> = HashMap::new();
        if let Some(scripts) = root.get("scripts") {
            match scripts.value.as_object() {
                None => self.diagnostics.push(Diagnostic::error(
                    format!(
                        "expected \"scripts\" to be an object, got {}",
                        scripts.value.type_name()
                    ),
                    manifest.location(scripts.value.range),
                )),
                Some(properties) => {
                    for property in properties {
                        match property.value.as_str() {
                            Some(command) => {
                                script_commands.insert(
                                    property.name.clone(),
                                    (command.to_owned(), property.value.range),
                                );
                            }
                            None => self.diagnostics.push(Diagnostic::error(
                                format!(
                                    "expected script to be a string, got {}",
                                    property.value.type_name()
                                ),
                                manifest.location(property.value.range),
                            )),
                        }
                    }
                }
            }
        }

        // workspaces: list of glob strings.
        if let Some(workspaces) = root.get("workspaces") {
            match workspaces.value.as_array() {
                Some(values) => {
                    let mut patterns = Vec::with_capacity(values.len());
                    for value in values {
                        match value.as_str() {
                            Some(pattern) => patterns.push(pattern.to_owned()),
                            None => self.diagnostics.push(Diagnostic::error(
                                format!(
                                    "expected workspace entry to be a string, got {}",
                                    value.type_name()
                                ),
                                manifest.location(value.range),
                            )),
                        }
                    }
                    out.workspaces = Some(patterns);
                }
                None => self.diagnostics.push(Diagnostic::error(
                    format!(
                        "expected \"workspaces\" to be an array, got {}",
                        workspaces.value.type_name()
                    ),
                    manifest.location(workspaces.value.range),
                )),
            }
        }

        // wireit: object of name -> config object.
        let mut configured: HashMap<String, Option<RawScript>> = HashMap::new();
        if let Some(wireit) = root.get("wireit") {
            match wireit.value.as_object() {
                None => self.diagnostics.push(Diagnostic::error(
                    format!(
                        "expected \"wireit\" to be an object, got {}",
                        wireit.value.type_name()
                    ),
                    manifest.location(wireit.value.range),
                )),
                Some(properties) => {
                    for property in properties {
                        let mut wired = true;
                        match script_commands.get(&property.name) {
                            None => {
                                self.diagnostics.push(Diagnostic::error(
                                    format!(
                                        "script \"{}\" is configured in the wireit section, \
                                         but missing from the scripts section",
                                        property.name
                                    ),
                                    manifest.location(property.name_range),
                                ));
                                wired = false;
                            }
                            Some((command, command_range)) => {
                                // The scripts entry must hand control to
                                // wireit (or be blank, meaning the package
                                // manager wrapper invokes it).
                                if !command.is_empty() && !command.contains("wireit") {
                                    self.diagnostics.push(
                                        Diagnostic::error(
                                            format!(
                                                "script \"{}\" is configured in the wireit \
                                                 section, so its scripts entry must be blank \
                                                 or invoke wireit",
                                                property.name
                                            ),
                                            manifest.location(*command_range),
                                        )
                                        .with_supplemental(
                                            Some("wireit configuration here".to_owned()),
                                            manifest.location(property.name_range),
                                        ),
                                    );
                                    wired = false;
                                }
                            }
                        }
                        let raw = self.parse_script_config(&manifest, &property.value);
                        configured.insert(property.name.clone(), raw.filter(|_| wired));
                    }
                }
            }
        }

        // Plain scripts (declared but not wireit-configured) are standard
        // scripts with no declared files or output: always stale, never
        // cached, but runnable as dependencies.
        for (name, (command, range)) in &script_commands {
            if configured.contains_key(name) {
                continue;
            }
            if command.is_empty() {
                continue;
            }
            configured.insert(
                name.clone(),
                Some(RawScript {
                    execution: Execution::OneShot {
                        command: command.clone(),
                    },
                    dependencies: Vec::new(),
                    files: None,
                    output: None,
                    clean: Clean::Always,
                    env: Vec::new(),
                    allow_usually_excluded_paths: false,
                    config_range: *range,
                }),
            );
        }

        out.scripts = configured;
        out
    }

    /// Validate one `wireit[name]` config object. Returns `None` (with
    /// diagnostics recorded) if the config is too broken to use.
    fn parse_script_config(
        &mut self,
        manifest: &Arc<Manifest>,
        value: &SpannedValue,
    ) -> Option<RawScript> {
        let Some(_properties) = value.as_object() else {
            self.diagnostics.push(Diagnostic::error(
                format!("expected an object, got {}", value.type_name()),
                manifest.location(value.range),
            ));
            return None;
        };
        let mut ok = true;

        let command = match value.get("command") {
            None => None,
            Some(property) => match property.value.as_str() {
                Some(command) if !command.trim().is_empty() => Some(command.to_owned()),
                Some(_) => None,
                None => {
                    self.diagnostics.push(Diagnostic::error(
                        format!(
                            "expected \"command\" to be a string, got {}",
                            property.value.type_name()
                        ),
                        manifest.location(property.value.range),
                    ));
                    ok = false;
                    None
                }
            },
        };

        let mut dependencies = Vec::new();
        if let Some(property) = value.get("dependencies") {
            match property.value.as_array() {
                None => {
                    self.diagnostics.push(Diagnostic::error(
                        format!(
                            "expected \"dependencies\" to be an array, got {}",
                            property.value.type_name()
                        ),
                        manifest.location(property.value.range),
                    ));
                    ok = false;
                }
                Some(entries) => {
                    for entry in entries {
                        match &entry.kind {
                            SpannedKind::String(specifier) => dependencies.push(RawDependency {
                                specifier: specifier.clone(),
                                cascade: true,
                                pass_extra_args: false,
                                range: entry.range,
                            }),
                            SpannedKind::Object(_) => {
                                let Some(script) =
                                    entry.get("script").and_then(|p| p.value.as_str())
                                else {
                                    self.diagnostics.push(Diagnostic::error(
                                        "dependency object requires a \"script\" string",
                                        manifest.location(entry.range),
                                    ));
                                    ok = false;
                                    continue;
                                };
                                let cascade = entry
                                    .get("cascade")
                                    .and_then(|p| p.value.as_bool())
                                    .unwrap_or(true);
                                let pass_extra_args = entry
                                    .get("extra-args-pass-through")
                                    .and_then(|p| p.value.as_bool())
                                    .unwrap_or(false);
                                dependencies.push(RawDependency {
                                    specifier: script.to_owned(),
                                    cascade,
                                    pass_extra_args,
                                    range: entry.range,
                                });
                            }
                            _ => {
                                self.diagnostics.push(Diagnostic::error(
                                    format!(
                                        "expected dependency to be a string or object, got {}",
                                        entry.type_name()
                                    ),
                                    manifest.location(entry.range),
                                ));
                                ok = false;
                            }
                        }
                    }
                }
            }
        }

        let files = self.parse_string_array(manifest, value, "files", &mut ok);
        let output = self.parse_string_array(manifest, value, "output", &mut ok);
        for pattern in files.iter().flatten().chain(output.iter().flatten()) {
            if let Err(err) = glob::validate(pattern) {
                self.diagnostics.push(Diagnostic::error(
                    format!("{err:#}"),
                    manifest.location(value.range),
                ));
                ok = false;
            }
        }

        let clean = match value.get("clean") {
            None => Clean::Always,
            Some(property) => match &property.value.kind {
                SpannedKind::Bool(true) => Clean::Always,
                SpannedKind::Bool(false) => Clean::Never,
                SpannedKind::String(s) if s == "if-file-deleted" => Clean::IfFileDeleted,
                _ => {
                    self.diagnostics.push(Diagnostic::error(
                        "expected \"clean\" to be true, false, or \"if-file-deleted\"",
                        manifest.location(property.value.range),
                    ));
                    ok = false;
                    Clean::Always
                }
            },
        };

        let service = match value.get("service") {
            None => None,
            Some(property) => match &property.value.kind {
                SpannedKind::Bool(false) => None,
                SpannedKind::Bool(true) => Some(ReadyWhen::Spawn),
                SpannedKind::Object(_) => {
                    match self.parse_ready_when(manifest, &property.value) {
                        Some(ready_when) => Some(ready_when),
                        None => {
                            ok = false;
                            None
                        }
                    }
                }
                _ => {
                    self.diagnostics.push(Diagnostic::error(
                        format!(
                            "expected \"service\" to be a boolean or object, got {}",
                            property.value.type_name()
                        ),
                        manifest.location(property.value.range),
                    ));
                    ok = false;
                    None
                }
            },
        };

        let mut env = Vec::new();
        if let Some(values) = self.parse_string_array(manifest, value, "env", &mut ok) {
            env = values;
        }

        let allow_usually_excluded_paths = match value.get("allowUsuallyExcludedPaths") {
            None => false,
            Some(property) => match property.value.as_bool() {
                Some(allow) => allow,
                None => {
                    self.diagnostics.push(Diagnostic::error(
                        format!(
                            "expected \"allowUsuallyExcludedPaths\" to be a boolean, got {}",
                            property.value.type_name()
                        ),
                        manifest.location(property.value.range),
                    ));
                    ok = false;
                    false
                }
            },
        };

        let execution = match (command, service) {
            (Some(command), Some(ready_when)) => Execution::Service {
                command,
                ready_when,
            },
            (Some(command), None) => Execution::OneShot { command },
            (None, Some(_)) => {
                self.diagnostics.push(Diagnostic::error(
                    "a service requires a command",
                    manifest.location(value.range),
                ));
                ok = false;
                Execution::NoCommand
            }
            (None, None) => {
                if output.is_some() {
                    self.diagnostics.push(Diagnostic::error(
                        "output requires a command",
                        manifest.location(value.range),
                    ));
                    ok = false;
                }
                Execution::NoCommand
            }
        };

        if !ok {
            return None;
        }
        Some(RawScript {
            execution,
            dependencies,
            files,
            output,
            clean,
            env,
            allow_usually_excluded_paths,
            config_range: value.range,
        })
    }

    fn parse_ready_when(
        &mut self,
        manifest: &Arc<Manifest>,
        value: &SpannedValue,
    ) -> Option<ReadyWhen> {
        let Some(property) = value.get("readyWhen") else {
            // A bare `"service": {}` behaves like `true`.
            return Some(ReadyWhen::Spawn);
        };
        match &property.value.kind {
            SpannedKind::String(s) if s == "spawn" => Some(ReadyWhen::Spawn),
            SpannedKind::Object(_) => {
                let Some(pattern) = property
                    .value
                    .get("line-matches")
                    .and_then(|p| p.value.as_str())
                else {
                    self.diagnostics.push(Diagnostic::error(
                        "expected \"readyWhen\" to be \"spawn\" or {\"line-matches\": regex}",
                        manifest.location(property.value.range),
                    ));
                    return None;
                };
                if let Err(err) = regex::Regex::new(pattern) {
                    self.diagnostics.push(Diagnostic::error(
                        format!("invalid readiness pattern: {err}"),
                        manifest.location(property.value.range),
                    ));
                    return None;
                }
                Some(ReadyWhen::LineMatches(pattern.to_owned()))
            }
            _ => {
                self.diagnostics.push(Diagnostic::error(
                    "expected \"readyWhen\" to be \"spawn\" or {\"line-matches\": regex}",
                    manifest.location(property.value.range),
                ));
                None
            }
        }
    }

    fn parse_string_array(
        &mut self,
        manifest: &Arc<Manifest>,
        value: &SpannedValue,
        field: &str,
        ok: &mut bool,
    ) -> Option<Vec<String>> {
        let property = value.get(field)?;
        match property.value.as_array() {
            None => {
                self.diagnostics.push(Diagnostic::error(
                    format!(
                        "expected \"{field}\" to be an array, got {}",
                        property.value.type_name()
                    ),
                    manifest.location(property.value.range),
                ));
                *ok = false;
                None
            }
            Some(values) => {
                let mut out = Vec::with_capacity(values.len());
                for entry in values {
                    match entry.as_str() {
                        Some(s) => out.push(s.to_owned()),
                        None => {
                            self.diagnostics.push(Diagnostic::error(
                                format!(
                                    "expected \"{field}\" entry to be a string, got {}",
                                    entry.type_name()
                                ),
                                manifest.location(entry.range),
                            ));
                            *ok = false;
                        }
                    }
                }
                Some(out)
            }
        }
    }

    /// Pass 2: resolve one script's dependency specifiers into edges.
    async fn resolve_dependencies(
        &mut self,
        script: &ScriptRef,
        raw: &[RawDependency],
    ) -> Result<Option<Vec<Dependency>>> {
        let manifest_path = script.manifest_path();
        let mut edges = Vec::new();
        let mut ok = true;

        for dep in raw {
            let location = Some(Location::new(manifest_path.clone(), dep.range));
            if let Some(rest) = dep.specifier.strip_prefix("$WORKSPACES") {
                let name = match rest.strip_prefix(':') {
                    Some(name) if !name.is_empty() => name.to_owned(),
                    Some(_) => {
                        self.diagnostics.push(Diagnostic::error(
                            "expected a script name after \"$WORKSPACES:\"",
                            location.clone(),
                        ));
                        ok = false;
                        continue;
                    }
                    None if rest.is_empty() => script.name.clone(),
                    None => {
                        // Not actually a workspaces specifier ("$WORKSPACESX").
                        self.diagnostics.push(Diagnostic::error(
                            format!("cannot resolve dependency \"{}\"", dep.specifier),
                            location.clone(),
                        ));
                        ok = false;
                        continue;
                    }
                };
                let Some(patterns) = self
                    .packages
                    .get(&script.package)
                    .and_then(|package| package.workspaces.clone())
                else {
                    self.diagnostics.push(Diagnostic::error(
                        "\"$WORKSPACES\" requires a \"workspaces\" section in package.json",
                        location.clone(),
                    ));
                    ok = false;
                    continue;
                };
                let mut matched_any = false;
                for dir in self.workspace_dirs(&script.package, &patterns).await? {
                    // Silently omit workspace packages that don't declare
                    // the target script.
                    let declares = self
                        .packages
                        .get(&dir)
                        .is_some_and(|package| package.scripts.contains_key(&name));
                    if !declares {
                        continue;
                    }
                    matched_any = true;
                    edges.push(Dependency {
                        to: ScriptRef::new(dir, name.clone()),
                        cascade: dep.cascade,
                        pass_extra_args: dep.pass_extra_args,
                        location: location.clone(),
                    });
                }
                if !matched_any {
                    self.diagnostics.push(Diagnostic::error(
                        format!("no workspace declares a script named \"{name}\""),
                        location.clone(),
                    ));
                    ok = false;
                }
            } else if dep.specifier.starts_with("./") || dep.specifier.starts_with("../") {
                let Some((path_part, name)) = dep.specifier.rsplit_once(':') else {
                    self.diagnostics.push(Diagnostic::error(
                        format!(
                            "expected \"{}\" to be in the form \"./path:script\"",
                            dep.specifier
                        ),
                        location.clone(),
                    ));
                    ok = false;
                    continue;
                };
                edges.push(Dependency {
                    to: ScriptRef::new(normalize(&script.package.join(path_part)), name),
                    cascade: dep.cascade,
                    pass_extra_args: dep.pass_extra_args,
                    location,
                });
            } else {
                edges.push(Dependency {
                    to: ScriptRef::new(script.package.clone(), dep.specifier.clone()),
                    cascade: dep.cascade,
                    pass_extra_args: dep.pass_extra_args,
                    location,
                });
            }
        }

        Ok(ok.then_some(edges))
    }

    /// Pass 3: walk from the root, detect cycles, build immutable configs.
    async fn build(&mut self, root: &ScriptRef, extra_args: &[String]) -> Result<AnalyzeResult> {
        // Resolve every declared script's edges up front so the walk itself
        // is synchronous.
        let mut resolved: HashMap<ScriptRef, Option<(RawScript, Vec<Dependency>)>> = HashMap::new();
        let packages: Vec<(PathBuf, Vec<String>)> = self
            .packages
            .iter()
            .map(|(package, scripts)| (package.clone(), scripts.scripts.keys().cloned().collect()))
            .collect();
        for (package, names) in packages {
            for name in names {
                let script = ScriptRef::new(package.clone(), name.clone());
                let raw = self
                    .packages
                    .get(&package)
                    .and_then(|p| p.scripts.get(&name))
                    .cloned()
                    .expect("script listed above");
                let entry = match raw {
                    None => None,
                    Some(raw) => {
                        let edges =
                            self.resolve_dependencies(&script, &raw.dependencies).await?;
                        edges.map(|edges| (raw, edges))
                    }
                };
                resolved.insert(script, entry);
            }
        }

        let mut nodes: HashMap<ScriptRef, Node> = HashMap::new();
        let mut stack: Vec<ScriptRef> = Vec::new();
        let mut configs: HashMap<ScriptRef, Arc<ScriptConfig>> = HashMap::new();
        let root_config = self.visit(root, &resolved, &mut nodes, &mut stack, &mut configs);

        let Some(_) = root_config else {
            // Root itself missing is its own diagnostic.
            if !resolved.contains_key(root) && self.diagnostics.is_empty() {
                self.diagnostics.push(Diagnostic::error(
                    format!(
                        "no script named \"{}\" in {}",
                        root.name,
                        root.package.display()
                    ),
                    None,
                ));
            }
            let reason = self.classify(root);
            return Ok(Err(AnalysisFailure {
                reason,
                diagnostics: std::mem::take(&mut self.diagnostics),
            }));
        };

        // Thread extra args from the root through opted-in edges.
        if !extra_args.is_empty() {
            let mut queue = VecDeque::from([root.clone()]);
            let mut threaded: BTreeSet<ScriptRef> = BTreeSet::from([root.clone()]);
            while let Some(current) = queue.pop_front() {
                let Some(config) = configs.get(&current) else {
                    continue;
                };
                for dep in &config.dependencies {
                    if dep.pass_extra_args && threaded.insert(dep.to.clone()) {
                        queue.push_back(dep.to.clone());
                    }
                }
            }
            for script in threaded {
                if let Some(config) = configs.get(&script) {
                    let mut updated = (**config).clone();
                    updated.extra_args = Some(extra_args.to_vec());
                    configs.insert(script, Arc::new(updated));
                }
            }
        }

        let warnings = std::mem::take(&mut self.diagnostics);
        debug!(scripts = configs.len(), "analysis complete");
        Ok(Ok(ScriptGraph {
            root: root.clone(),
            scripts: configs,
            warnings,
        }))
    }

    fn classify(&self, root: &ScriptRef) -> FailureReason {
        if self.saw_cycle {
            FailureReason::Cycle
        } else if self
            .packages
            .get(&root.package)
            .is_none_or(|package| package.scripts.is_empty())
        {
            FailureReason::NoScriptsToRun
        } else {
            FailureReason::InvalidConfig
        }
    }

    fn visit(
        &mut self,
        script: &ScriptRef,
        resolved: &HashMap<ScriptRef, Option<(RawScript, Vec<Dependency>)>>,
        nodes: &mut HashMap<ScriptRef, Node>,
        stack: &mut Vec<ScriptRef>,
        configs: &mut HashMap<ScriptRef, Arc<ScriptConfig>>,
    ) -> Option<Arc<ScriptConfig>> {
        match nodes.get(script) {
            Some(Node::InProgress) => {
                // Found a back edge. Report the whole cycle once, in
                // dependency order, then treat the edge as broken.
                self.saw_cycle = true;
                let start = stack
                    .iter()
                    .position(|ancestor| ancestor == script)
                    .expect("in-progress node is on the stack");
                let chain = stack[start..]
                    .iter()
                    .map(ToString::to_string)
                    .chain([script.to_string()])
                    .collect::<Vec<_>>()
                    .join(" -> ");
                let mut diagnostic = Diagnostic::error(
                    format!("dependency cycle: {chain}"),
                    Some(Location::new(
                        script.manifest_path(),
                        resolved
                            .get(script)
                            .and_then(|entry| entry.as_ref())
                            .map(|(raw, _)| raw.config_range)
                            .unwrap_or(SourceRange::file_start()),
                    )),
                );
                for ancestor in &stack[start..] {
                    if let Some(Some((raw, _))) = resolved.get(ancestor) {
                        diagnostic = diagnostic.with_supplemental(
                            Some(format!("{ancestor} participates in the cycle")),
                            Location::new(ancestor.manifest_path(), raw.config_range),
                        );
                    }
                }
                self.diagnostics.push(diagnostic);
                return None;
            }
            Some(Node::Done(config)) => return config.clone(),
            None => {}
        }

        let Some(Some((raw, edges))) = resolved.get(script) else {
            if !resolved.contains_key(script) {
                self.diagnostics.push(Diagnostic::error(
                    format!(
                        "no script named \"{}\" in {}",
                        script.name,
                        script.package.display()
                    ),
                    None,
                ));
            }
            nodes.insert(script.clone(), Node::Done(None));
            return None;
        };
        let (raw, edges) = (raw.clone(), edges.clone());

        nodes.insert(script.clone(), Node::InProgress);
        stack.push(script.clone());

        let mut ok = true;
        let mut service_deps: BTreeSet<ScriptRef> = BTreeSet::new();
        for edge in &edges {
            match self.visit(&edge.to, resolved, nodes, stack, configs) {
                None => ok = false,
                Some(dep_config) => {
                    if dep_config.is_service() {
                        service_deps.insert(dep_config.script.clone());
                    } else {
                        service_deps.extend(dep_config.service_deps.iter().cloned());
                    }
                }
            }
        }

        stack.pop();
        if !ok {
            nodes.insert(script.clone(), Node::Done(None));
            return None;
        }

        let config = Arc::new(ScriptConfig {
            script: script.clone(),
            execution: raw.execution,
            dependencies: edges,
            files: raw.files,
            output: raw.output,
            clean: raw.clean,
            env: raw.env,
            allow_usually_excluded_paths: raw.allow_usually_excluded_paths,
            service_deps: service_deps.into_iter().collect(),
            extra_args: None,
            directly_invoked: stack.is_empty(),
            declaring_file: script.manifest_path(),
            config_location: Some(Location::new(script.manifest_path(), raw.config_range)),
        });
        nodes.insert(script.clone(), Node::Done(Some(config.clone())));
        configs.insert(script.clone(), config.clone());
        Some(config)
    }
}

/// Resolve `.` and `..` components without touching the filesystem, so that
/// `/repo/pkg/../other` and `/repo/other` are the same script-ref key.
fn normalize(path: &Path) -> PathBuf {
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
