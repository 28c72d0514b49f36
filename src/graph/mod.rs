//! Job graph construction.
//!
//! A [`GraphBuilder`] collects jobs into an arena; jobs refer to their
//! prerequisites by [`NodeId`], so a job reachable through several paths is
//! still one job. [`GraphBuilder::finish`] freezes the arena into an
//! immutable [`JobGraph`] rooted at one node, which is what the
//! [`Scheduler`] consumes.

pub mod scheduler;

pub use scheduler::{RunReport, Scheduler};

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Work performed by a job once all of its dependencies succeeded.
pub type Action = Box<dyn FnOnce() -> Result<()> + Send>;

/// Identity of a job within one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A unit of work in the build graph
pub struct Job {
    description: String,
    result: Option<PathBuf>,
    dependencies: Vec<NodeId>,
    action: Option<Action>,
}

impl Job {
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Path produced by this job. Only meaningful once the job has run.
    pub fn result(&self) -> Option<&Path> {
        self.result.as_deref()
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    /// True for jobs that only represent an already available result
    pub fn is_pass_through(&self) -> bool {
        self.action.is_none()
    }

    pub(crate) fn take_action(&mut self) -> Option<Action> {
        self.action.take()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("description", &self.description)
            .field("result", &self.result)
            .field("dependencies", &self.dependencies)
            .field("pass_through", &self.is_pass_through())
            .finish()
    }
}

/// Mutable arena of jobs
#[derive(Debug, Default)]
pub struct GraphBuilder {
    jobs: Vec<Job>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job that runs `action` after every job in `dependencies`.
    pub fn add<F>(
        &mut self,
        description: impl Into<String>,
        dependencies: &[NodeId],
        action: F,
    ) -> NodeId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.push(description.into(), None, dependencies, Some(Box::new(action)))
    }

    /// Like [`GraphBuilder::add`], recording the path the action produces.
    pub fn add_with_result<F>(
        &mut self,
        description: impl Into<String>,
        result: PathBuf,
        dependencies: &[NodeId],
        action: F,
    ) -> NodeId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.push(
            description.into(),
            Some(result),
            dependencies,
            Some(Box::new(action)),
        )
    }

    /// Add a job without an action standing for a result that already exists.
    pub fn pass_through(&mut self, description: impl Into<String>, result: PathBuf) -> NodeId {
        self.push(description.into(), Some(result), &[], None)
    }

    /// Add a job without an action that completes once `dependencies` have.
    pub fn group(&mut self, description: impl Into<String>, dependencies: &[NodeId]) -> NodeId {
        self.push(description.into(), None, dependencies, None)
    }

    fn push(
        &mut self,
        description: String,
        result: Option<PathBuf>,
        dependencies: &[NodeId],
        action: Option<Action>,
    ) -> NodeId {
        let mut deps: Vec<NodeId> = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !deps.contains(dep) {
                deps.push(*dep);
            }
        }
        let id = NodeId(self.jobs.len());
        self.jobs.push(Job {
            description,
            result,
            dependencies: deps,
            action,
        });
        id
    }

    /// Make `node` wait for `dependency`.
    ///
    /// Rejects unknown nodes and edges that would close a cycle; the graph is
    /// left unchanged in that case.
    pub fn add_dependency(&mut self, node: NodeId, dependency: NodeId) -> Result<()> {
        self.check(node)?;
        self.check(dependency)?;
        if self.reaches(dependency, node) {
            return Err(BuildError::InvalidGraph(format!(
                "adding {} -> {} would create a cycle",
                self.jobs[node.0].description, self.jobs[dependency.0].description
            ))
            .into());
        }
        let deps = &mut self.jobs[node.0].dependencies;
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, id: NodeId) -> Option<&Job> {
        self.jobs.get(id.0)
    }

    /// Freeze the arena into a graph containing `root` and everything it
    /// transitively depends on.
    pub fn finish(self, root: NodeId) -> Result<JobGraph> {
        self.check(root)?;
        for job in &self.jobs {
            for dep in &job.dependencies {
                self.check(*dep)?;
            }
        }

        let mut members = vec![false; self.jobs.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if members[id.0] {
                continue;
            }
            members[id.0] = true;
            stack.extend(self.jobs[id.0].dependencies.iter().copied());
        }

        Ok(JobGraph {
            jobs: self.jobs,
            members,
            root,
        })
    }

    fn check(&self, id: NodeId) -> Result<()> {
        if id.0 < self.jobs.len() {
            Ok(())
        } else {
            Err(BuildError::InvalidGraph(format!("unknown node {}", id.0)).into())
        }
    }

    /// True if `to` is `from` or one of its transitive dependencies.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = vec![false; self.jobs.len()];
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            match seen.get_mut(id.0) {
                Some(visited) if !*visited => *visited = true,
                _ => continue,
            }
            stack.extend(self.jobs[id.0].dependencies.iter().copied());
        }
        false
    }
}

/// Immutable DAG rooted at a single job
#[derive(Debug)]
pub struct JobGraph {
    jobs: Vec<Job>,
    members: Vec<bool>,
    root: NodeId,
}

impl JobGraph {
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Result path of the root job
    pub fn result(&self) -> Option<&Path> {
        self.jobs[self.root.0].result()
    }

    /// Number of jobs reachable from the root
    pub fn len(&self) -> usize {
        self.members.iter().filter(|m| **m).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.get(id.0).copied().unwrap_or(false)
    }

    pub fn job(&self, id: NodeId) -> Option<&Job> {
        if self.contains(id) {
            self.jobs.get(id.0)
        } else {
            None
        }
    }

    /// Jobs reachable from the root, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Job)> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(i, _)| self.members[*i])
            .map(|(i, job)| (NodeId(i), job))
    }

    pub(crate) fn into_parts(self) -> (Vec<Job>, Vec<bool>, NodeId) {
        (self.jobs, self.members, self.root)
    }
}
