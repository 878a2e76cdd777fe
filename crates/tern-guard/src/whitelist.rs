//! Compiled whitelist patterns and their on-disk JSON list files.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::GuardError;

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Regex,
}

#[derive(Debug, Clone, Default)]
/// An ordered set of regular expressions, compiled once.
///
/// Each pattern is matched unanchored; authors add `^`/`$` where they want them.
pub struct Whitelist {
    patterns: Vec<CompiledPattern>,
}

impl Whitelist {
    /// Compiles every pattern, keeping the valid ones and returning the errors
    /// for malformed ones. A malformed pattern never matches anything.
    pub fn compile<I, S>(patterns: I) -> (Self, Vec<GuardError>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut whitelist = Self::default();
        let mut errors = Vec::new();
        for pattern in patterns {
            match compile_pattern(pattern.as_ref()) {
                Ok(compiled) => whitelist.patterns.push(compiled),
                Err(error) => errors.push(error),
            }
        }
        (whitelist, errors)
    }

    /// Compiles every pattern, failing on the first malformed one.
    pub fn try_compile<I, S>(patterns: I) -> Result<Self, GuardError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut whitelist = Self::default();
        for pattern in patterns {
            whitelist.patterns.push(compile_pattern(pattern.as_ref())?);
        }
        Ok(whitelist)
    }

    pub fn matches(&self, fragment: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.regex.is_match(fragment))
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|pattern| pattern.source.as_str())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns a whitelist holding `self`'s patterns followed by `other`'s.
    pub fn layered(&self, other: &Whitelist) -> Whitelist {
        let mut patterns = self.patterns.clone();
        patterns.extend(other.patterns.iter().cloned());
        Whitelist { patterns }
    }
}

fn compile_pattern(pattern: &str) -> Result<CompiledPattern, GuardError> {
    if pattern.trim().is_empty() {
        return Err(GuardError::EmptyPattern);
    }
    let regex = Regex::new(pattern).map_err(|source| GuardError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(CompiledPattern {
        source: pattern.to_string(),
        regex,
    })
}

#[derive(Debug, Clone)]
/// A whitelist file: a JSON array of regular-expression strings.
pub struct WhitelistFile {
    path: PathBuf,
}

impl WhitelistFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the raw pattern list; a missing file is an empty list.
    pub fn read(&self) -> Result<Vec<String>, GuardError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| GuardError::Read {
            path: self.path.clone(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<String>>(&raw).map_err(|source| GuardError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn write(&self, patterns: &[String]) -> Result<(), GuardError> {
        tern_core::write_json_atomic(&self.path, &patterns).map_err(|error| GuardError::Write {
            path: self.path.clone(),
            message: format!("{error:#}"),
        })
    }

    /// Appends a validated pattern; returns false when it was already present.
    pub fn add(&self, pattern: &str) -> Result<bool, GuardError> {
        compile_pattern(pattern)?;
        let mut patterns = self.read()?;
        if patterns.iter().any(|existing| existing == pattern) {
            return Ok(false);
        }
        patterns.push(pattern.to_string());
        self.write(&patterns)?;
        Ok(true)
    }

    /// Removes a pattern; returns false when it was not present.
    pub fn remove(&self, pattern: &str) -> Result<bool, GuardError> {
        let mut patterns = self.read()?;
        let before = patterns.len();
        patterns.retain(|existing| existing != pattern);
        if patterns.len() == before {
            return Ok(false);
        }
        self.write(&patterns)?;
        Ok(true)
    }
}
