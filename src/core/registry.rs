//! Job kind registry.
//!
//! The registry maps every declared [`JobKind`] to exactly one handler and its
//! effective parallelism limit. It is assembled once at startup with a
//! [`JobRegistryBuilder`] and is immutable afterwards, so the scheduler shares it
//! as an `Arc<JobRegistry>` without locking.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::handler::JobHandler;
use super::types::JobKind;

/// Errors raised while assembling the registry. All of them are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler or override asked for fewer than one concurrent execution.
    #[error("invalid max_parallel {value} for kind '{kind}': must be at least 1")]
    InvalidParallelism { kind: JobKind, value: usize },

    /// A second handler was registered for the same kind.
    #[error("duplicate handler for kind: {0}")]
    DuplicateKind(JobKind),

    /// A handler was registered for a kind that is not declared.
    #[error("handler registered for undeclared kind: {0}")]
    UndeclaredKind(JobKind),

    /// An override names a kind that is not declared.
    #[error("max_parallel override for unknown kind: {0}")]
    UnknownOverride(JobKind),

    /// One or more declared kinds have no handler.
    #[error("no handler registered for kinds: {}", format_kinds(.0))]
    MissingKinds(Vec<JobKind>),
}

fn format_kinds(kinds: &[JobKind]) -> String {
    kinds
        .iter()
        .map(JobKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A registered handler together with its effective parallelism limit.
#[derive(Clone)]
pub struct RegisteredKind {
    handler: Arc<dyn JobHandler>,
    max_parallel: Option<usize>,
}

impl RegisteredKind {
    /// The handler executing this kind.
    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    /// The effective limit after overrides. `None` is unbounded.
    pub fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }
}

impl std::fmt::Debug for RegisteredKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredKind")
            .field("kind", &self.handler.kind())
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

/// Validated, read-only mapping from kind to handler.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    entries: HashMap<JobKind, RegisteredKind>,
}

impl JobRegistry {
    /// Look up the entry for a kind.
    pub fn get(&self, kind: &JobKind) -> Option<&RegisteredKind> {
        self.entries.get(kind)
    }

    /// Check if a kind has a handler.
    pub fn contains(&self, kind: &JobKind) -> bool {
        self.entries.contains_key(kind)
    }

    /// Iterate over all registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &JobKind> {
        self.entries.keys()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder validating registrations against the declared kind list.
pub struct JobRegistryBuilder {
    declared: Vec<JobKind>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    overrides: HashMap<JobKind, usize>,
}

impl JobRegistryBuilder {
    /// Create a builder for the given declared kinds.
    pub fn new<I, K>(declared: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<JobKind>,
    {
        let mut kinds: Vec<JobKind> = Vec::new();
        for kind in declared {
            let kind = kind.into();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        Self {
            declared: kinds,
            handlers: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    fn is_declared(&self, kind: &JobKind) -> bool {
        self.declared.contains(kind)
    }

    /// Register the handler for its kind.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<(), RegistryError> {
        let kind = handler.kind();

        if let Some(value) = handler.max_parallel().filter(|value| *value < 1) {
            return Err(RegistryError::InvalidParallelism { kind, value });
        }
        if !self.is_declared(&kind) {
            return Err(RegistryError::UndeclaredKind(kind));
        }
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind(kind));
        }

        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Register a handler, consuming and returning the builder.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Override a kind's parallelism limit for this deployment.
    pub fn override_max_parallel(
        &mut self,
        kind: impl Into<JobKind>,
        value: usize,
    ) -> Result<(), RegistryError> {
        let kind = kind.into();

        if !self.is_declared(&kind) {
            return Err(RegistryError::UnknownOverride(kind));
        }
        if value < 1 {
            return Err(RegistryError::InvalidParallelism { kind, value });
        }

        self.overrides.insert(kind, value);
        Ok(())
    }

    /// Apply a set of overrides, typically loaded from configuration.
    pub fn with_parallelism_overrides<I, K>(mut self, overrides: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (K, usize)>,
        K: Into<JobKind>,
    {
        for (kind, value) in overrides {
            self.override_max_parallel(kind, value)?;
        }
        Ok(self)
    }

    /// Validate and freeze the registry.
    ///
    /// Fails listing every declared kind that has no handler.
    pub fn build(mut self) -> Result<JobRegistry, RegistryError> {
        let missing: Vec<JobKind> = self
            .declared
            .iter()
            .filter(|kind| !self.handlers.contains_key(*kind))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(RegistryError::MissingKinds(missing));
        }

        let entries = self
            .handlers
            .drain()
            .map(|(kind, handler)| {
                let max_parallel = self
                    .overrides
                    .get(&kind)
                    .copied()
                    .or_else(|| handler.max_parallel());
                (
                    kind,
                    RegisteredKind {
                        handler,
                        max_parallel,
                    },
                )
            })
            .collect();

        Ok(JobRegistry { entries })
    }
}
