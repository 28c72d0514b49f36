/// External compiler and archiver invocation
///
/// The builder only knows the [`Toolchain`] trait; [`CommandToolchain`] is the
/// implementation that spawns real binaries.
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use crate::error::BuildError;

/// Compiler and archiver used to build a library
pub trait Toolchain: Send + Sync {
    /// Run the C compiler with `args` (flags followed by `-o <object> <source>`).
    fn compile(&self, args: &[String]) -> Result<()>;

    /// Create a static archive at `output` containing `objects`, in order.
    fn archive(&self, output: &Path, objects: &[PathBuf]) -> Result<()>;
}

/// Toolchain backed by external `cc`/`ar` style binaries
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    cc: PathBuf,
    ar: PathBuf,
}

impl CommandToolchain {
    /// Resolve `cc` and `ar` from `PATH`, falling back to the names as given.
    pub fn new(cc: &str, ar: &str) -> Self {
        Self {
            cc: resolve(cc),
            ar: resolve(ar),
        }
    }

    pub fn cc(&self) -> &Path {
        &self.cc
    }

    pub fn ar(&self) -> &Path {
        &self.ar
    }
}

impl Default for CommandToolchain {
    fn default() -> Self {
        Self::new("clang", "llvm-ar")
    }
}

impl Toolchain for CommandToolchain {
    fn compile(&self, args: &[String]) -> Result<()> {
        let mut cmd = Command::new(&self.cc);
        cmd.args(args);
        run_tool(&self.cc, cmd)
    }

    fn archive(&self, output: &Path, objects: &[PathBuf]) -> Result<()> {
        // `ar r` appends to an existing archive.
        match fs::remove_file(output) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BuildError::io(output, e).into()),
        }

        // D: zero timestamps and owner ids for reproducible archives
        let mut cmd = Command::new(&self.ar);
        cmd.arg("rcsD").arg(output).args(objects);
        run_tool(&self.ar, cmd)
    }
}

fn resolve(tool: &str) -> PathBuf {
    which::which(tool).unwrap_or_else(|e| {
        warn!("Could not find '{}' in PATH: {}. Trying as-is.", tool, e);
        PathBuf::from(tool)
    })
}

fn run_tool(tool: &Path, mut cmd: Command) -> Result<()> {
    debug!("Command: {:?}", cmd);

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("Failed to spawn {}", tool.display()))?;

    if output.status.success() {
        return Ok(());
    }

    Err(BuildError::ToolFailed {
        tool: tool.display().to_string(),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
    .into())
}
