// Common test utilities shared across integration tests
//
// Every test gets its own workspace with separate source, scratch and cache
// directories under one TempDir, and builds with FakeToolchain instead of a
// real cross compiler. The fake writes objects whose content depends only on
// the source text and the debug path after prefix mapping, so identical
// inputs give byte-identical archives no matter where the scratch directory
// lives.

use anyhow::{bail, Context, Result};
use rtbuild::{ArtifactCache, Builder, DeclaredLibrary, LibrarySet, Toolchain};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// One recorded toolchain call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Compile { source: PathBuf, object: PathBuf },
    Archive { output: PathBuf, objects: Vec<PathBuf> },
}

/// In-process stand-in for clang and llvm-ar
#[derive(Default)]
pub struct FakeToolchain {
    invocations: Mutex<Vec<Invocation>>,
    compile_args: Mutex<Vec<Vec<String>>>,
    fail_on: Option<String>,
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

#[allow(dead_code)]
impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every compile whose source file name is `file_name`
    pub fn failing_on(file_name: &str) -> Self {
        Self {
            fail_on: Some(file_name.to_string()),
            ..Self::default()
        }
    }

    /// Sleep in every compile so parallel jobs overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn compile_args(&self) -> Vec<Vec<String>> {
        self.compile_args.lock().unwrap().clone()
    }

    pub fn compile_count(&self) -> usize {
        self.invocations()
            .iter()
            .filter(|i| matches!(i, Invocation::Compile { .. }))
            .count()
    }

    pub fn archive_count(&self) -> usize {
        self.invocations()
            .iter()
            .filter(|i| matches!(i, Invocation::Archive { .. }))
            .count()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl Toolchain for FakeToolchain {
    fn compile(&self, args: &[String]) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let result = self.compile_inner(args);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn archive(&self, output: &Path, objects: &[PathBuf]) -> Result<()> {
        self.invocations.lock().unwrap().push(Invocation::Archive {
            output: output.to_path_buf(),
            objects: objects.to_vec(),
        });
        let mut content = Vec::new();
        for object in objects {
            content.extend(fs::read(object).with_context(|| format!("reading {}", object.display()))?);
        }
        fs::write(output, content)?;
        Ok(())
    }
}

impl FakeToolchain {
    fn compile_inner(&self, args: &[String]) -> Result<()> {
        self.compile_args.lock().unwrap().push(args.to_vec());

        let n = args.len();
        if n < 3 || args[n - 3] != "-o" {
            bail!("unexpected compile arguments: {:?}", args);
        }
        let object = PathBuf::from(&args[n - 2]);
        let source = PathBuf::from(&args[n - 1]);
        self.invocations.lock().unwrap().push(Invocation::Compile {
            source: source.clone(),
            object: object.clone(),
        });

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let file_name = source.file_name().unwrap().to_string_lossy().into_owned();
        if self.fail_on.as_deref() == Some(file_name.as_str()) {
            bail!("error: expected ';' in {}", file_name);
        }
        for include in args.iter().filter_map(|a| a.strip_prefix("-I")) {
            if !Path::new(include).is_dir() {
                bail!("fatal error: include directory {} not found", include);
            }
        }

        let text = fs::read_to_string(&source)?;
        let debug_path = remap(args, &object);
        fs::write(&object, format!("{}\n{}", debug_path, text))?;
        Ok(())
    }
}

/// Apply the `-fdebug-prefix-map` argument the way the compiler would.
fn remap(args: &[String], path: &Path) -> String {
    let path = path.to_string_lossy().into_owned();
    for arg in args {
        if let Some(mapping) = arg.strip_prefix("-fdebug-prefix-map=") {
            if let Some((from, to)) = mapping.split_once('=') {
                if let Some(rest) = path.strip_prefix(from) {
                    return format!("{}{}", to, rest);
                }
            }
        }
    }
    path
}

/// Isolated directories for one test
pub struct TestWorkspace {
    temp_dir: TempDir,
    scratch_count: AtomicUsize,
}

#[allow(dead_code)]
impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
            scratch_count: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn source_dir(&self) -> PathBuf {
        self.path().join("src")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    /// A fresh, empty scratch directory
    pub fn scratch(&self) -> PathBuf {
        let n = self.scratch_count.fetch_add(1, Ordering::SeqCst);
        let dir = self.path().join(format!("scratch-{n}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a source file, back-dated so a cache entry created right after
    /// is strictly newer even on filesystems with coarse timestamps.
    pub fn create_source(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.source_dir().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        set_mtime(&path, SystemTime::now() - Duration::from_secs(60));
        path
    }

    /// Declared library over the workspace source directory
    pub fn library(&self, name: &str) -> DeclaredLibrary {
        DeclaredLibrary::new(name, self.source_dir())
    }

    pub fn builder(&self, libraries: LibrarySet, toolchain: Arc<dyn Toolchain>) -> Builder {
        Builder::new(libraries, ArtifactCache::new(self.cache_dir()), toolchain)
    }

    /// Names of everything directly under the cache root
    pub fn cache_entries(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.cache_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn set_mtime(path: &Path, time: SystemTime) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

pub fn library_set(libraries: impl IntoIterator<Item = DeclaredLibrary>) -> LibrarySet {
    LibrarySet::from_declared(libraries)
}
