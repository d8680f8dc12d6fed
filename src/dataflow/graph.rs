//! Typed collection handles.
//!
//! Epistemic foundation:
//! - K_i: A collection is an immutable plan node plus the descriptor its
//!   records conform to
//! - K_i: Building a handle never runs computation; only an executor does
//! - B_i: Operators may be malformed → rejected while the plan is built

use super::engine::{Executor, Job, MemorySink};
use crate::assembler::{Assembler, AssemblerGenerator, FieldExpr};
use crate::models::{Result, StagepointError, TypeDescriptor, Value};
use crate::storage::Storage;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Record transform applied by a map node.
pub type MapFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Record predicate applied by a filter node.
pub type Predicate = Arc<dyn Fn(&Value) -> Result<bool> + Send + Sync>;

/// Identity of a plan node, unique within the process.
pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum NodeKind {
    Source(Arc<Vec<Value>>),
    Checkpoint {
        storage: Arc<dyn Storage>,
        path: PathBuf,
    },
    Map {
        input: Collection,
        f: MapFn,
    },
    Filter {
        input: Collection,
        predicate: Predicate,
    },
    Select {
        input: Collection,
        assembler: Arc<Assembler>,
    },
}

impl NodeKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            NodeKind::Source(_) => "source",
            NodeKind::Checkpoint { .. } => "checkpoint",
            NodeKind::Map { .. } => "map",
            NodeKind::Filter { .. } => "filter",
            NodeKind::Select { .. } => "select",
        }
    }

    pub(crate) fn input(&self) -> Option<&Collection> {
        match self {
            NodeKind::Source(_) | NodeKind::Checkpoint { .. } => None,
            NodeKind::Map { input, .. }
            | NodeKind::Filter { input, .. }
            | NodeKind::Select { input, .. } => Some(input),
        }
    }

    /// Detach the input handle, leaving an empty source in its place.
    fn take_input(&mut self) -> Option<Collection> {
        if self.input().is_none() {
            return None;
        }
        match std::mem::replace(self, NodeKind::Source(Arc::default())) {
            NodeKind::Map { input, .. }
            | NodeKind::Filter { input, .. }
            | NodeKind::Select { input, .. } => Some(input),
            NodeKind::Source(_) | NodeKind::Checkpoint { .. } => None,
        }
    }
}

pub(crate) struct PlanNode {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) descriptor: TypeDescriptor,
}

impl Drop for PlanNode {
    /// Unlinks the chain of uniquely owned ancestors one node at a time, so
    /// dropping a long plan does not recurse.
    fn drop(&mut self) {
        let mut next = self.kind.take_input();
        while let Some(collection) = next {
            next = match Arc::try_unwrap(collection.node) {
                Ok(mut node) => node.kind.take_input(),
                Err(_) => None,
            };
        }
    }
}

/// Handle to a typed sequence of records produced by a plan.
///
/// Cloning a handle shares the plan node; the records are computed only when
/// an executor runs a job that reads it.
#[derive(Clone)]
pub struct Collection {
    pub(crate) node: Arc<PlanNode>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.node.id)
            .field("kind", &self.node.kind.label())
            .field("descriptor", &self.node.descriptor.to_string())
            .finish()
    }
}

impl Collection {
    fn from_node(kind: NodeKind, descriptor: TypeDescriptor) -> Self {
        Self {
            node: Arc::new(PlanNode {
                id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                descriptor,
            }),
        }
    }

    /// In-memory source. Every value must conform to `descriptor`.
    pub fn from_values(descriptor: TypeDescriptor, values: Vec<Value>) -> Result<Self> {
        if let Some(bad) = values.iter().find(|v| !v.conforms_to(descriptor.root())) {
            return Err(StagepointError::TypeMismatch(format!(
                "source value {bad} does not conform to {descriptor}"
            )));
        }
        Ok(Self::from_node(NodeKind::Source(Arc::new(values)), descriptor))
    }

    /// Source reading a checkpoint written at `path`, typed by `descriptor`.
    pub fn from_checkpoint(
        storage: Arc<dyn Storage>,
        path: impl Into<PathBuf>,
        descriptor: TypeDescriptor,
    ) -> Self {
        Self::from_node(
            NodeKind::Checkpoint {
                storage,
                path: path.into(),
            },
            descriptor,
        )
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.node.descriptor
    }

    /// Checkpoint path this collection reads from, if it is a checkpoint source.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        match &self.node.kind {
            NodeKind::Checkpoint { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Apply `f` to every record. Its outputs must conform to `output`;
    /// a non-conforming output fails the job.
    pub fn map<F>(&self, output: TypeDescriptor, f: F) -> Collection
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self::from_node(
            NodeKind::Map {
                input: self.clone(),
                f: Arc::new(f),
            },
            output,
        )
    }

    /// Keep records for which `predicate` holds.
    pub fn filter<F>(&self, predicate: F) -> Collection
    where
        F: Fn(&Value) -> Result<bool> + Send + Sync + 'static,
    {
        Self::from_node(
            NodeKind::Filter {
                input: self.clone(),
                predicate: Arc::new(predicate),
            },
            self.descriptor().clone(),
        )
    }

    /// Project records through a generated assembler.
    ///
    /// Generation happens here, so malformed expressions fail before any
    /// record is processed.
    pub fn select(
        &self,
        generator: &AssemblerGenerator,
        output: TypeDescriptor,
        exprs: &[FieldExpr],
    ) -> Result<Collection> {
        let assembler = generator.generate(self.descriptor(), &output, exprs)?;
        Ok(Self::from_node(
            NodeKind::Select {
                input: self.clone(),
                assembler,
            },
            output,
        ))
    }

    /// Run a job that materializes this collection in memory.
    pub fn collect(&self, executor: &dyn Executor) -> Result<Vec<Value>> {
        let (sink, records) = MemorySink::new();
        let mut job = Job::new();
        job.add_sink(self.clone(), Box::new(sink));
        executor.execute(job)?;
        records.take()
    }
}
