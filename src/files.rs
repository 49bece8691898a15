//! Source file matching and destination mapping
//!
//! Patterns are globs relative to the task file directory (or `cwd`).
//! A pattern starting with `!` removes earlier matches. Only regular files are
//! returned, in match order, without duplicates.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use log::debug;

use crate::error::TaskError;

/// One matched source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFile {
    pub path: PathBuf,
    /// Path relative to the search root (`cwd` when set), `/`-separated
    pub relative: String,
    /// Path as written in the task file: `cwd` plus `relative`
    pub display: String,
}

/// A source file and the blob name it uploads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub src: PathBuf,
    pub dest: String,
}

/// The file part of a task target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSources {
    pub src: Vec<String>,
    pub cwd: Option<String>,
    pub dest: Option<String>,
    pub expand: bool,
}

impl FileSources {
    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    /// Resolves the patterns against `base`.
    pub fn matches(&self, base: &Path) -> Result<Vec<MatchedFile>, TaskError> {
        let root = match &self.cwd {
            Some(cwd) => base.join(cwd),
            None => base.to_path_buf(),
        };
        let options = MatchOptions {
            require_literal_leading_dot: true,
            ..MatchOptions::new()
        };

        let mut matched: Vec<MatchedFile> = Vec::new();
        for pattern in &self.src {
            if let Some(negated) = pattern.strip_prefix('!') {
                let exclude = Pattern::new(&normalize(negated))?;
                matched.retain(|m| !exclude.matches_with(&m.relative, options));
                continue;
            }

            let full = root.join(pattern);
            for entry in glob::glob_with(&full.to_string_lossy(), options)? {
                let path = entry.map_err(|e| TaskError::io(&full, e.into_error()))?;
                if !path.is_file() {
                    continue;
                }
                let relative = path
                    .strip_prefix(&root)
                    .map(|p| normalize(&p.to_string_lossy()))
                    .unwrap_or_else(|_| normalize(&path.to_string_lossy()));
                if matched.iter().any(|m| m.relative == relative) {
                    continue;
                }
                let display = match &self.cwd {
                    Some(cwd) => join_blob_path(cwd, &relative),
                    None => relative.clone(),
                };
                matched.push(MatchedFile { path, relative, display });
            }
        }
        debug!("{} file(s) matched {:?}", matched.len(), self.src);
        Ok(matched)
    }

    /// Maps every matched file to a destination blob name.
    ///
    /// A `dest` with an extension names a single file every source maps to;
    /// otherwise `dest` is a directory prefix. In expand mode the path below
    /// `cwd` is used, else the path as matched.
    pub fn map(&self, base: &Path) -> Result<Vec<FileMapping>, TaskError> {
        let dest = self.dest.as_deref().unwrap_or("");
        let dest_is_file = dest_is_file(dest);
        Ok(self
            .matches(base)?
            .into_iter()
            .map(|file| {
                let name = if dest_is_file {
                    normalize(dest)
                } else if self.expand {
                    join_blob_path(dest, &file.relative)
                } else {
                    join_blob_path(dest, &file.display)
                };
                FileMapping { src: file.path, dest: name }
            })
            .collect())
    }
}

/// True when `dest` looks like a file name (has an extension).
pub fn dest_is_file(dest: &str) -> bool {
    !dest.ends_with('/') && Path::new(dest).extension().is_some()
}

/// `/`-separated path with `\` converted and `.`/empty segments dropped.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn join_blob_path(prefix: &str, path: &str) -> String {
    normalize(&format!("{}/{}", prefix, path))
}

/// Reads every matched file as UTF-8 text, in match order.
pub async fn read_sources(sources: &FileSources, base: &Path) -> Result<Vec<(PathBuf, String)>, TaskError> {
    let mut contents = Vec::new();
    for file in sources.matches(base)? {
        let text = tokio::fs::read_to_string(&file.path)
            .await
            .map_err(|e| TaskError::io(&file.path, e))?;
        contents.push((file.path, text));
    }
    Ok(contents)
}
