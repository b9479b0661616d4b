//! Configuration diagnostics.
//!
//! Analysis failures are not errors: they are values, collected rather than
//! thrown, so that a single pass over a manifest can surface every problem it
//! finds with byte-accurate locations. Unexpected failures (bugs, I/O falling
//! over) stay on the `color_eyre::Result` channel instead.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// A half-open byte range into a source file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct SourceRange {
    pub offset: usize,
    pub length: usize,
}

impl SourceRange {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// A zero-width range pointing at the start of a file.
    pub fn file_start() -> Self {
        Self {
            offset: 0,
            length: 0,
        }
    }
}

/// A byte range inside a specific file.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub range: SourceRange,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, range: SourceRange) -> Self {
        Self {
            file: file.into(),
            range,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}..{}",
            self.file.display(),
            self.range.offset,
            self.range.offset + self.range.length
        )
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

/// A supplementary location attached to a diagnostic, pointing at related
/// configuration (the other end of a cycle edge, the colliding declaration).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Supplemental {
    pub message: Option<String>,
    pub location: Location,
}

/// One user-facing configuration problem.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// The primary location. Absent only for problems with no source text to
    /// point at (a missing manifest file, for example).
    pub location: Option<Location>,
    pub supplemental: Vec<Supplemental>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, location: impl Into<Option<Location>>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location: location.into(),
            supplemental: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, location: impl Into<Option<Location>>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location: location.into(),
            supplemental: Vec::new(),
        }
    }

    pub fn with_supplemental(
        mut self,
        message: impl Into<Option<String>>,
        location: Location,
    ) -> Self {
        self.supplemental.push(Supplemental {
            message: message.into(),
            location,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(location) = &self.location {
            write!(f, "\n  --> {location}")?;
        }
        for supplemental in &self.supplemental {
            match &supplemental.message {
                Some(message) => write!(f, "\n  note: {message} ({})", supplemental.location)?,
                None => write!(f, "\n  note: {}", supplemental.location)?,
            }
        }
        Ok(())
    }
}
