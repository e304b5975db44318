//! Target registry.
//!
//! Jobs name their target by string. Every process that builds or runs jobs
//! holds a [`Registry`] mapping those names to Rust closures, so targets are
//! resolved against a fixed table instead of being looked up dynamically.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::scheduler::job::{Args, JobBuilder};
use crate::worker::targets;

/// Sentinel target used by control jobs. Always resolvable, never executes.
pub const NOOP_TARGET: &str = "noop";

/// Error raised by a target while running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TargetError(pub String);

impl TargetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for TargetError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for TargetError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

pub type TargetFn =
    Arc<dyn Fn(&Args, &mut Execution) -> Result<Value, TargetError> + Send + Sync>;

/// State scoped to a single running job.
///
/// Captures everything the target writes and collects child jobs, which
/// inherit this execution's context when they are built.
#[derive(Debug)]
pub struct Execution {
    context: String,
    output: String,
    children: Vec<JobBuilder>,
}

impl Execution {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            output: String::new(),
            children: Vec::new(),
        }
    }

    /// Context of the job currently executing.
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Queue a child job for submission once the target returns.
    pub fn spawn(&mut self, child: JobBuilder) {
        let child = child.inherit_context(self.context.clone());
        self.children.push(child);
    }

    pub fn children(&self) -> &[JobBuilder] {
        &self.children
    }

    pub fn into_parts(self) -> (String, Vec<JobBuilder>) {
        (self.output, self.children)
    }
}

impl fmt::Write for Execution {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.output.push_str(s);
        Ok(())
    }
}

/// Name to closure table of invokable targets.
#[derive(Clone, Default)]
pub struct Registry {
    targets: HashMap<String, TargetFn>,
    bundles: Vec<String>,
}

impl Registry {
    /// Empty registry. Only the no-op sentinel resolves.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `builtin` bundle loaded.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        targets::install_builtin(&mut registry);
        registry.bundles.push(targets::BUILTIN.to_string());
        registry
    }

    /// Registry with `builtin` plus every named bundle.
    pub fn with_bundles<S: AsRef<str>>(names: &[S]) -> crate::error::Result<Self> {
        let mut registry = Self::builtin();
        for name in names {
            registry.load_bundle(name.as_ref())?;
        }
        Ok(registry)
    }

    /// Load a named bundle of targets. Loading a bundle twice is a no-op.
    pub fn load_bundle(&mut self, name: &str) -> crate::error::Result<()> {
        if self.bundles.iter().any(|b| b == name) {
            return Ok(());
        }
        targets::install(self, name)?;
        self.bundles.push(name.to_string());
        tracing::debug!(bundle = name, "Loaded target bundle");
        Ok(())
    }

    pub fn register<F>(&mut self, name: &str, target: F)
    where
        F: Fn(&Args, &mut Execution) -> Result<Value, TargetError> + Send + Sync + 'static,
    {
        self.targets.insert(name.to_string(), Arc::new(target));
    }

    pub fn contains(&self, name: &str) -> bool {
        name == NOOP_TARGET || self.targets.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Option<TargetFn> {
        self.targets.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bundles(&self) -> &[String] {
        &self.bundles
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("targets", &self.names())
            .field("bundles", &self.bundles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn noop_always_resolves_by_name() {
        let registry = Registry::new();
        assert!(registry.contains(NOOP_TARGET));
        assert!(registry.resolve(NOOP_TARGET).is_none());
        assert!(!registry.contains("strlen"));
    }

    #[test]
    fn unknown_bundle_is_rejected() {
        let err = Registry::with_bundles(&["nope"]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn bundle_loads_once() {
        let mut registry = Registry::builtin();
        registry.load_bundle(targets::DIAGNOSTICS).unwrap();
        registry.load_bundle(targets::DIAGNOSTICS).unwrap();
        assert_eq!(registry.bundles(), &["builtin", "diagnostics"]);
    }

    #[test]
    fn execution_captures_output() {
        let mut exec = Execution::new("ctx-1");
        write!(exec, "hello {}", 42).unwrap();
        assert_eq!(exec.output(), "hello 42");
        assert_eq!(exec.context(), "ctx-1");
    }
}
