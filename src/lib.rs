// Library interface for rtbuild
// Builds and caches the native support libraries (compiler runtime, libc,
// startup objects) a cross-compiling toolchain links against.

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod library;
pub mod logging;
pub mod toolchain;

// Re-export commonly used types
pub use builder::{BuildConfig, BuildPlan, Builder, LibraryJob, TargetConfig};
pub use cache::{default_cache_dir, output_name, ArtifactCache};
pub use config::EngineConfig;
pub use error::BuildError;
pub use graph::{GraphBuilder, Job, JobGraph, NodeId, RunReport, Scheduler};
pub use library::{DeclaredLibrary, Library, LibrarySet};
pub use toolchain::{CommandToolchain, Toolchain};
