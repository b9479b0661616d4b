//! Package manifest reading and caching.
//!
//! Manifests are parsed with a JSON parser that retains byte offsets, then
//! converted into an owned spanned tree so diagnostics can point at the
//! exact range of the offending value. Parsed results are cached per
//! absolute path; watch mode invalidates by dropping the cache wholesale
//! before re-analysis.
//!
//! A missing file and a syntax error are returned as values, never thrown,
//! so the analyzer can attach them to diagnostics.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::Result;
use jsonc_parser::{CollectOptions, ParseOptions, ast, parse_to_ast};
use tokio::sync::Mutex;
use tracing::{instrument, trace};

use crate::{
    diagnostic::{Diagnostic, Location, SourceRange},
    fs::Fs,
};

/// An owned JSON value with its byte range in the source file.
#[derive(Clone, PartialEq, Debug)]
pub struct SpannedValue {
    pub range: SourceRange,
    pub kind: SpannedKind,
}

#[derive(Clone, PartialEq, Debug)]
pub enum SpannedKind {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<SpannedValue>),
    Object(Vec<SpannedProperty>),
}

#[derive(Clone, PartialEq, Debug)]
pub struct SpannedProperty {
    pub name: String,
    pub name_range: SourceRange,
    pub value: SpannedValue,
}

impl SpannedValue {
    /// Look up a property by name. Only meaningful on objects.
    pub fn get(&self, name: &str) -> Option<&SpannedProperty> {
        match &self.kind {
            SpannedKind::Object(properties) => {
                properties.iter().find(|property| property.name == name)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            SpannedKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.kind {
            SpannedKind::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[SpannedValue]> {
        match &self.kind {
            SpannedKind::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[SpannedProperty]> {
        match &self.kind {
            SpannedKind::Object(properties) => Some(properties),
            _ => None,
        }
    }

    /// A short name for the value's type, for "expected X, got Y" messages.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            SpannedKind::Null => "null",
            SpannedKind::Bool(_) => "boolean",
            SpannedKind::Number(_) => "number",
            SpannedKind::String(_) => "string",
            SpannedKind::Array(_) => "array",
            SpannedKind::Object(_) => "object",
        }
    }
}

/// A parsed package manifest.
#[derive(Clone, Debug)]
pub struct Manifest {
    /// Absolute path of the manifest file.
    pub path: PathBuf,
    /// The raw source text, kept for line/column rendering.
    pub source: Arc<String>,
    /// The root value (almost always an object).
    pub root: SpannedValue,
}

impl Manifest {
    pub fn location(&self, range: SourceRange) -> Location {
        Location::new(self.path.clone(), range)
    }
}

/// The result of reading a manifest: always a value, never an error.
#[derive(Clone, Debug)]
pub enum ManifestFile {
    Parsed(Arc<Manifest>),
    Missing,
    Invalid(Arc<Diagnostic>),
}

/// Reads and caches package manifests.
#[derive(Clone, Debug)]
pub struct ManifestReader {
    fs: Fs,
    cache: Arc<Mutex<HashMap<PathBuf, ManifestFile>>>,
    /// In-memory contents taking precedence over disk, for editor
    /// integrations that analyze unsaved buffers.
    overlay: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl ManifestReader {
    pub fn new(fs: Fs) -> Self {
        Self {
            fs,
            cache: Arc::new(Mutex::new(HashMap::new())),
            overlay: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read and parse the manifest at `path`, using the cache when possible.
    #[instrument(skip(self))]
    pub async fn read(&self, path: &Path) -> Result<ManifestFile> {
        if let Some(cached) = self.cache.lock().await.get(path) {
            return Ok(cached.clone());
        }

        let source = match self.overlay.lock().await.get(path) {
            Some(content) => Some(content.clone()),
            None => self.fs.read_to_string(path).await?,
        };
        let parsed = match source {
            None => ManifestFile::Missing,
            Some(source) => parse_manifest(path, source),
        };

        self.cache
            .lock()
            .await
            .insert(path.to_path_buf(), parsed.clone());
        Ok(parsed)
    }

    /// Drop every cached manifest. Watch mode calls this before re-analysis.
    pub async fn invalidate_all(&self) {
        self.cache.lock().await.clear();
        trace!("invalidated manifest cache");
    }

    /// Provide in-memory content for a path, shadowing the file on disk.
    pub async fn set_overlay(&self, path: impl Into<PathBuf>, content: String) {
        let path = path.into();
        self.overlay.lock().await.insert(path.clone(), content);
        self.cache.lock().await.remove(&path);
    }
}

fn parse_manifest(path: &Path, source: String) -> ManifestFile {
    let parsed = parse_to_ast(
        &source,
        &CollectOptions::default(),
        &ParseOptions::default(),
    );
    match parsed {
        Ok(result) => match result.value {
            Some(value) => ManifestFile::Parsed(Arc::new(Manifest {
                path: path.to_path_buf(),
                root: convert(value),
                source: Arc::new(source),
            })),
            None => ManifestFile::Invalid(Arc::new(Diagnostic::error(
                "manifest file is empty",
                Location::new(path, SourceRange::file_start()),
            ))),
        },
        Err(err) => ManifestFile::Invalid(Arc::new(Diagnostic::error(
            format!("invalid JSON: {err}"),
            Location::new(path, SourceRange::file_start()),
        ))),
    }
}

fn to_range(range: jsonc_parser::common::Range) -> SourceRange {
    SourceRange::new(range.start, range.end.saturating_sub(range.start))
}

fn convert(value: ast::Value<'_>) -> SpannedValue {
    match value {
        ast::Value::NullKeyword(null) => SpannedValue {
            range: to_range(null.range),
            kind: SpannedKind::Null,
        },
        ast::Value::BooleanLit(lit) => SpannedValue {
            range: to_range(lit.range),
            kind: SpannedKind::Bool(lit.value),
        },
        ast::Value::NumberLit(lit) => SpannedValue {
            range: to_range(lit.range),
            kind: SpannedKind::Number(lit.value.parse().unwrap_or(0.0)),
        },
        ast::Value::StringLit(lit) => SpannedValue {
            range: to_range(lit.range),
            kind: SpannedKind::String(lit.value.into_owned()),
        },
        ast::Value::Array(array) => SpannedValue {
            range: to_range(array.range),
            kind: SpannedKind::Array(array.elements.into_iter().map(convert).collect()),
        },
        ast::Value::Object(object) => SpannedValue {
            range: to_range(object.range),
            kind: SpannedKind::Object(
                object
                    .properties
                    .into_iter()
                    .map(|property| {
                        let (name, name_range) = match property.name {
                            ast::ObjectPropName::String(lit) => {
                                (lit.value.into_owned(), to_range(lit.range))
                            }
                            ast::ObjectPropName::Word(word) => {
                                (word.value.to_string(), to_range(word.range))
                            }
                        };
                        SpannedProperty {
                            name,
                            name_range,
                            value: convert(property.value),
                        }
                    })
                    .collect(),
            ),
        },
    }
}
