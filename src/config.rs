use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::builder::TargetConfig;
use crate::cache::default_cache_dir;
use crate::library::DeclaredLibrary;

/// Complete engine configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub target: TargetConfig,

    /// Native libraries known to the builder
    #[serde(default, rename = "library")]
    pub libraries: Vec<DeclaredLibrary>,
}

/// Artifact cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Cache root directory. Empty means the platform cache directory.
    #[serde(default)]
    pub dir: String,
}

/// Settings for the job scheduler and the external tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Maximum number of parallel jobs (0 = one per CPU)
    #[serde(default)]
    pub jobs: usize,

    /// C compiler binary
    #[serde(default = "default_cc")]
    pub cc: String,

    /// Archiver binary
    #[serde(default = "default_ar")]
    pub ar: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            jobs: 0,
            cc: default_cc(),
            ar: default_ar(),
        }
    }
}

fn default_cc() -> String {
    "clang".to_string()
}

fn default_ar() -> String {
    "llvm-ar".to_string()
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML configuration")
    }

    /// Override settings from `RTBUILD_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("RTBUILD_CACHE_DIR") {
            self.cache.dir = dir;
        }
        if let Ok(jobs) = std::env::var("RTBUILD_JOBS") {
            self.build.jobs = jobs
                .trim()
                .parse()
                .with_context(|| format!("RTBUILD_JOBS must be a number: {jobs}"))?;
        }
        if let Ok(cc) = std::env::var("RTBUILD_CC") {
            self.build.cc = cc;
        }
        if let Ok(ar) = std::env::var("RTBUILD_AR") {
            self.build.ar = ar;
        }
        Ok(())
    }

    /// Resolved cache root directory
    pub fn cache_dir(&self) -> PathBuf {
        let dir = self.cache.dir.trim();
        if dir.is_empty() {
            return default_cache_dir();
        }
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }

    /// Example configuration file contents
    pub fn example() -> String {
        let config = EngineConfig {
            cache: CacheConfig {
                dir: "~/.cache/rtbuild".to_string(),
            },
            target: TargetConfig::new("thumbv7em-unknown-unknown-eabi").with_cpu("cortex-m4"),
            libraries: vec![DeclaredLibrary {
                name: "picolibc".to_string(),
                source_dir: PathBuf::from("lib/picolibc/newlib"),
                startup_source: None,
                sources: vec!["libc/string/*.c".to_string()],
                target_sources: Default::default(),
                cflags: vec![
                    "-nostdlibinc".to_string(),
                    "-I{source}/libc/include".to_string(),
                    "-I{include}".to_string(),
                ],
                headers: vec!["libc/include/*.h".to_string()],
            }],
            ..Default::default()
        };

        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.build.cc.trim().is_empty() {
            anyhow::bail!("build.cc must be set");
        }
        if self.build.ar.trim().is_empty() {
            anyhow::bail!("build.ar must be set");
        }

        let mut seen = std::collections::HashSet::new();
        for library in &self.libraries {
            if library.name.is_empty() {
                anyhow::bail!("library.name must be set");
            }
            if library.name.contains(['/', '\\']) {
                anyhow::bail!("library.name must not contain path separators: {}", library.name);
            }
            if !seen.insert(library.name.as_str()) {
                anyhow::bail!("library declared more than once: {}", library.name);
            }
            library.validate()?;
        }

        Ok(())
    }
}
