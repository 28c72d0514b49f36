//! Turning library descriptions into built, cached archives.
//!
//! [`Builder::load`] resolves a library in three steps: a precompiled
//! archive supplied by the configuration wins outright, then a fresh cache
//! entry, and only then is a job graph built and scheduled. The graph for a
//! library is one compile job per source, an optional header job every
//! compile job waits for, an optional startup object job, and one archive job
//! at the root that publishes the result into the cache.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{output_name, ArtifactCache};
use crate::config::EngineConfig;
use crate::error::BuildError;
use crate::graph::{GraphBuilder, JobGraph, NodeId, Scheduler};
use crate::library::{flags, Library, LibrarySet};
use crate::logging::{operations, status};
use crate::toolchain::{CommandToolchain, Toolchain};

/// File name of the archive inside a cache entry
pub const ARCHIVE_NAME: &str = "lib.a";

/// File name of the startup object inside a cache entry
pub const STARTUP_OBJECT_NAME: &str = "crt1.o";

/// What the builder needs to know about the current build
pub trait BuildConfig {
    /// Target triple, e.g. "thumbv7em-unknown-unknown-eabi"
    fn triple(&self) -> &str;

    /// Target CPU; empty when not set
    fn cpu(&self) -> &str;

    /// Prebuilt location of library `name`, if one ships for this target
    fn precompiled(&self, name: &str) -> Option<PathBuf>;
}

/// Plain [`BuildConfig`] implementation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub triple: String,

    #[serde(default)]
    pub cpu: String,

    /// Library name to precompiled archive path
    #[serde(default)]
    pub precompiled: BTreeMap<String, PathBuf>,
}

impl TargetConfig {
    pub fn new(triple: impl Into<String>) -> Self {
        Self {
            triple: triple.into(),
            ..Default::default()
        }
    }

    pub fn with_cpu(mut self, cpu: impl Into<String>) -> Self {
        self.cpu = cpu.into();
        self
    }

    pub fn with_precompiled(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.precompiled.insert(name.into(), path.into());
        self
    }
}

impl BuildConfig for TargetConfig {
    fn triple(&self) -> &str {
        &self.triple
    }

    fn cpu(&self) -> &str {
        &self.cpu
    }

    fn precompiled(&self, name: &str) -> Option<PathBuf> {
        self.precompiled.get(name).cloned()
    }
}

/// How a library ended up in a job graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryJob {
    /// Supplied by the configuration; no job was added.
    Precompiled(PathBuf),
    /// Fresh cache entry, represented by a pass-through job.
    Cached { node: NodeId, archive: PathBuf },
    /// Needs building; `node` is the archive job.
    Build {
        node: NodeId,
        archive: PathBuf,
        temp_dir: PathBuf,
    },
}

impl LibraryJob {
    /// Archive path, valid once the job (if any) has run
    pub fn archive(&self) -> &Path {
        match self {
            LibraryJob::Precompiled(path) => path,
            LibraryJob::Cached { archive, .. } | LibraryJob::Build { archive, .. } => archive,
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            LibraryJob::Precompiled(_) => None,
            LibraryJob::Cached { node, .. } | LibraryJob::Build { node, .. } => Some(*node),
        }
    }

    fn temp_dir(&self) -> Option<&Path> {
        match self {
            LibraryJob::Build { temp_dir, .. } => Some(temp_dir),
            _ => None,
        }
    }
}

/// A library resolved either to a ready path or to a graph to run
#[derive(Debug)]
pub enum BuildPlan {
    Precompiled(PathBuf),
    Graph(JobGraph),
}

impl BuildPlan {
    pub fn archive(&self) -> Option<&Path> {
        match self {
            BuildPlan::Precompiled(path) => Some(path),
            BuildPlan::Graph(graph) => graph.result(),
        }
    }
}

/// Builds native libraries through the artifact cache
pub struct Builder {
    libraries: LibrarySet,
    cache: ArtifactCache,
    toolchain: Arc<dyn Toolchain>,
    scheduler: Scheduler,
}

impl Builder {
    pub fn new(libraries: LibrarySet, cache: ArtifactCache, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            libraries,
            cache,
            toolchain,
            scheduler: Scheduler::default(),
        }
    }

    /// Builder using the configured cache, tools, worker count and libraries
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            LibrarySet::from_declared(config.libraries.iter().cloned()),
            ArtifactCache::new(config.cache_dir()),
            Arc::new(CommandToolchain::new(&config.build.cc, &config.build.ar)),
        )
        .with_scheduler(Scheduler::new(config.build.jobs))
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn libraries(&self) -> &LibrarySet {
        &self.libraries
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Build (or fetch) the registered library `name` and return its archive.
    ///
    /// `scratch_dir` holds intermediate object files; the caller removes it
    /// afterwards.
    pub fn load(&self, name: &str, config: &dyn BuildConfig, scratch_dir: &Path) -> Result<PathBuf> {
        let library = self.lookup(name)?;
        self.load_library(&library, config, scratch_dir)
    }

    /// Like [`Builder::load`] for a library that need not be registered.
    pub fn load_library(
        &self,
        library: &Arc<dyn Library>,
        config: &dyn BuildConfig,
        scratch_dir: &Path,
    ) -> Result<PathBuf> {
        let mut graph = GraphBuilder::new();
        let job = self.plan_into(&mut graph, library, config, scratch_dir)?;
        let Some(node) = job.node() else {
            return Ok(job.archive().to_path_buf());
        };
        self.run(graph, node, std::slice::from_ref(&job))?;
        Ok(job.archive().to_path_buf())
    }

    /// Build several registered libraries in one graph so their compile jobs
    /// share the worker pool. Archives are returned in the order of `names`.
    pub fn load_many(
        &self,
        names: &[&str],
        config: &dyn BuildConfig,
        scratch_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut graph = GraphBuilder::new();
        let mut planned: Vec<(String, LibraryJob)> = Vec::new();
        for name in names {
            if planned.iter().any(|(n, _)| n == name) {
                continue;
            }
            let job = self
                .lookup(name)
                .and_then(|library| self.plan_into(&mut graph, &library, config, scratch_dir));
            match job {
                Ok(job) => planned.push((name.to_string(), job)),
                Err(e) => {
                    discard_temp_dirs(planned.iter().map(|(_, job)| job));
                    return Err(e);
                }
            }
        }

        let nodes: Vec<NodeId> = planned.iter().filter_map(|(_, job)| job.node()).collect();
        if !nodes.is_empty() {
            let root = graph.group("libraries", &nodes);
            let jobs: Vec<LibraryJob> = planned.iter().map(|(_, job)| job.clone()).collect();
            self.run(graph, root, &jobs)?;
        }

        Ok(names
            .iter()
            .filter_map(|name| planned.iter().find(|(n, _)| n == name))
            .map(|(_, job)| job.archive().to_path_buf())
            .collect())
    }

    /// Resolve `library` to a precompiled path or a finished job graph
    /// without running anything.
    pub fn plan(
        &self,
        library: &Arc<dyn Library>,
        config: &dyn BuildConfig,
        scratch_dir: &Path,
    ) -> Result<BuildPlan> {
        let mut graph = GraphBuilder::new();
        match self.plan_into(&mut graph, library, config, scratch_dir)? {
            LibraryJob::Precompiled(path) => Ok(BuildPlan::Precompiled(path)),
            job => {
                let node = job.node().context("planned library job has no node")?;
                Ok(BuildPlan::Graph(graph.finish(node)?))
            }
        }
    }

    /// Add the jobs needed to produce `library` to `graph`.
    pub fn plan_into(
        &self,
        graph: &mut GraphBuilder,
        library: &Arc<dyn Library>,
        config: &dyn BuildConfig,
        scratch_dir: &Path,
    ) -> Result<LibraryJob> {
        let name = library.name().to_string();

        if let Some(path) = config.precompiled(&name) {
            info!(
                operation = operations::LIBRARY_LOAD,
                status = status::PRECOMPILED,
                library = %name,
                path = %path.display(),
                "using precompiled library"
            );
            return Ok(LibraryJob::Precompiled(path));
        }

        let triple = config.triple().to_string();
        let cpu = config.cpu().to_string();
        let outname = output_name(&name, &triple, &cpu, &flags::stable_flags(&triple, &cpu));
        let root = library.source_root().to_path_buf();
        let sources = library.sources(&triple)?;
        let source_paths: Vec<PathBuf> = library
            .startup_source()
            .into_iter()
            .chain(sources.iter().map(PathBuf::as_path))
            .map(|relative| root.join(relative))
            .collect();

        if let Some(entry) = self.cache.load(&outname, &source_paths)? {
            info!(
                operation = operations::LIBRARY_LOAD,
                status = status::HIT,
                library = %name,
                output_name = %outname,
                "library is cached"
            );
            let archive = entry.join(ARCHIVE_NAME);
            let node = graph.pass_through(format!("cached {name}/{ARCHIVE_NAME}"), archive.clone());
            return Ok(LibraryJob::Cached { node, archive });
        }

        info!(
            operation = operations::LIBRARY_LOAD,
            status = status::MISS,
            library = %name,
            output_name = %outname,
            "building library"
        );

        let build_dir = scratch_dir.join(format!("build-lib-{name}"));
        fs::create_dir(&build_dir).map_err(|e| BuildError::io(&build_dir, e))?;
        // Lives inside the cache root so the final rename stays on one
        // filesystem. Nothing below can fail before the job owns it.
        let out_dir = self.cache.temp_dir(&outname)?;

        let args = Arc::new(flags::compile_flags(
            library.cflags(&triple, &out_dir),
            &triple,
            &cpu,
            &build_dir,
            &name,
        ));
        debug!(library = %name, "compile flags: {}", args.join(" "));

        let mut compile_deps = Vec::new();
        if library.has_headers() {
            let include_dir = out_dir.join("include");
            let lib = Arc::clone(library);
            let target = triple.clone();
            compile_deps.push(graph.add(
                format!("headers {name}/include"),
                &[],
                move || {
                    fs::create_dir(&include_dir).map_err(|e| BuildError::io(&include_dir, e))?;
                    lib.make_headers(&target, &include_dir)
                },
            ));
        }

        let mut archive_deps = Vec::new();
        let mut objects = Vec::new();
        let mut object_names = HashSet::new();
        for source in sources {
            let src_path = root.join(&source);
            let obj_path = build_dir.join(object_name(&source, &mut object_names));
            objects.push(obj_path.clone());
            archive_deps.push(self.compile_job(graph, &args, src_path, obj_path, &compile_deps));
        }

        if let Some(startup) = library.startup_source() {
            let src_path = root.join(startup);
            let obj_path = out_dir.join(STARTUP_OBJECT_NAME);
            archive_deps.push(self.compile_job(graph, &args, src_path, obj_path, &compile_deps));
        }

        let archive = self.cache.entry_path(&outname).join(ARCHIVE_NAME);
        let toolchain = Arc::clone(&self.toolchain);
        let cache = self.cache.clone();
        let temp_dir = out_dir.clone();
        let node = graph.add_with_result(
            format!("ar {name}/{ARCHIVE_NAME}"),
            archive.clone(),
            &archive_deps,
            move || {
                toolchain
                    .archive(&out_dir.join(ARCHIVE_NAME), &objects)
                    .with_context(|| format!("failed to make archive for {triple}"))?;
                cache.store(&out_dir, &outname, &source_paths)?;
                Ok(())
            },
        );

        Ok(LibraryJob::Build {
            node,
            archive,
            temp_dir,
        })
    }

    fn compile_job(
        &self,
        graph: &mut GraphBuilder,
        args: &Arc<Vec<String>>,
        src_path: PathBuf,
        obj_path: PathBuf,
        dependencies: &[NodeId],
    ) -> NodeId {
        let args = Arc::clone(args);
        let toolchain = Arc::clone(&self.toolchain);
        graph.add_with_result(
            format!("compile {}", src_path.display()),
            obj_path.clone(),
            dependencies,
            move || {
                let mut compile_args = Vec::with_capacity(args.len() + 3);
                compile_args.extend(args.iter().cloned());
                compile_args.push("-o".to_string());
                compile_args.push(obj_path.to_string_lossy().into_owned());
                compile_args.push(src_path.to_string_lossy().into_owned());
                toolchain.compile(&compile_args).map_err(|source| {
                    BuildError::Command {
                        tag: BuildError::FAILED_TO_BUILD,
                        path: src_path,
                        source,
                    }
                    .into()
                })
            },
        )
    }

    fn run(&self, graph: GraphBuilder, root: NodeId, jobs: &[LibraryJob]) -> Result<()> {
        let result = graph
            .finish(root)
            .and_then(|graph| self.scheduler.run(graph));
        if result.is_err() {
            discard_temp_dirs(jobs);
        }
        result.map(|_| ())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Library>> {
        self.libraries.get(name).ok_or_else(|| {
            BuildError::UnknownLibrary {
                name: name.to_string(),
            }
            .into()
        })
    }
}

/// Remove the unpublished output directories of `jobs`, which would
/// otherwise pile up in the cache root.
fn discard_temp_dirs<'a>(jobs: impl IntoIterator<Item = &'a LibraryJob>) {
    for dir in jobs.into_iter().filter_map(LibraryJob::temp_dir) {
        if let Err(e) = fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %dir.display(),
                    "Failed to remove temporary output directory: {}", e
                );
            }
        }
    }
}

/// Object file name for `source`: its base name plus ".o". A name already
/// taken falls back to the whole relative path, then to a numbered variant
/// of it.
fn object_name(source: &Path, used: &mut HashSet<String>) -> String {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut candidate = format!("{base}.o");
    if used.insert(candidate.clone()) {
        return candidate;
    }

    let flattened = source
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("_");
    candidate = format!("{flattened}.o");
    let mut n = 1;
    while !used.insert(candidate.clone()) {
        candidate = format!("{flattened}.{n}.o");
        n += 1;
    }
    candidate
}
