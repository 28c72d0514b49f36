/// Data-driven library descriptions
///
/// A [`DeclaredLibrary`] is read from the `[[library]]` tables of the engine
/// configuration. Sources and headers are glob patterns relative to the
/// library's source directory.
use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::Library;

/// Extra sources used only for targets whose triple starts with `prefix`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSources {
    pub prefix: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// A library described entirely by configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredLibrary {
    pub name: String,

    /// Source directory; relative sources and headers resolve against it
    pub source_dir: PathBuf,

    /// Source of the startup object, relative to `source_dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_source: Option<PathBuf>,

    /// Source globs used for every target
    #[serde(default)]
    pub sources: Vec<String>,

    /// Library flags. `{source}` expands to the source directory, `{out}` to
    /// the temporary output directory and `{include}` to `{out}/include`.
    #[serde(default)]
    pub cflags: Vec<String>,

    /// Header globs copied into the include directory before compiling
    #[serde(default)]
    pub headers: Vec<String>,

    #[serde(default)]
    pub target_sources: Vec<TargetSources>,
}

impl DeclaredLibrary {
    pub fn new(name: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_dir: source_dir.into(),
            startup_source: None,
            sources: Vec::new(),
            cflags: Vec::new(),
            headers: Vec::new(),
            target_sources: Vec::new(),
        }
    }

    pub fn with_sources<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_startup_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.startup_source = Some(path.into());
        self
    }

    pub fn with_cflags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cflags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn with_headers<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_target_sources<I, S>(mut self, prefix: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_sources.push(TargetSources {
            prefix: prefix.into(),
            sources: patterns.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Check that every source and header pattern is a valid glob.
    pub fn validate(&self) -> Result<()> {
        let patterns = self
            .sources
            .iter()
            .chain(self.target_sources.iter().flat_map(|t| t.sources.iter()))
            .chain(self.headers.iter());
        for pattern in patterns {
            glob::Pattern::new(pattern).with_context(|| {
                format!("library {}: invalid glob pattern: {}", self.name, pattern)
            })?;
        }
        Ok(())
    }

    /// Expand `patterns` relative to the source directory.
    ///
    /// Each pattern's matches are sorted; patterns keep their declared order
    /// and a file matched twice is only listed once. A pattern without glob
    /// metacharacters is taken literally even if the file does not exist, so
    /// a missing source surfaces as an error when the cache stats it.
    fn expand(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for pattern in patterns {
            if !pattern.contains(['*', '?', '[']) {
                let path = PathBuf::from(pattern);
                if !paths.contains(&path) {
                    paths.push(path);
                }
                continue;
            }

            let full_pattern = self.source_dir.join(pattern);
            let full_pattern = full_pattern.to_string_lossy();
            let mut matches = Vec::new();
            for entry in
                glob(&full_pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?
            {
                let path =
                    entry.with_context(|| format!("Failed to read glob entry for: {}", pattern))?;
                if path.is_file() {
                    let relative = path
                        .strip_prefix(&self.source_dir)
                        .map(Path::to_path_buf)
                        .unwrap_or(path);
                    matches.push(relative);
                }
            }
            matches.sort();
            for path in matches {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    fn expand_placeholders(&self, flag: &str, out_dir: &Path) -> String {
        flag.replace("{include}", &out_dir.join("include").to_string_lossy())
            .replace("{out}", &out_dir.to_string_lossy())
            .replace("{source}", &self.source_dir.to_string_lossy())
    }
}

impl Library for DeclaredLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_root(&self) -> &Path {
        &self.source_dir
    }

    fn sources(&self, target: &str) -> Result<Vec<PathBuf>> {
        let mut patterns = self.sources.clone();
        for extra in &self.target_sources {
            if target.starts_with(&extra.prefix) {
                patterns.extend(extra.sources.iter().cloned());
            }
        }
        self.expand(&patterns)
            .with_context(|| format!("Failed to list sources of {} for {}", self.name, target))
    }

    fn startup_source(&self) -> Option<&Path> {
        self.startup_source.as_deref()
    }

    fn cflags(&self, _target: &str, out_dir: &Path) -> Vec<String> {
        self.cflags
            .iter()
            .map(|flag| self.expand_placeholders(flag, out_dir))
            .collect()
    }

    fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    fn make_headers(&self, _target: &str, include_dir: &Path) -> Result<()> {
        for header in self.expand(&self.headers)? {
            let src = self.source_dir.join(&header);
            // Headers keep their path below the first directory matched by
            // the pattern, e.g. include/sys/types.h -> sys/types.h.
            let relative = header
                .components()
                .skip(1)
                .collect::<PathBuf>();
            let relative = if relative.as_os_str().is_empty() {
                header.clone()
            } else {
                relative
            };
            let dest = include_dir.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(&src, &dest).with_context(|| {
                format!("Failed to copy header {} to {}", src.display(), dest.display())
            })?;
        }
        Ok(())
    }
}
