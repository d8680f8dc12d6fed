//! Job execution.
//!
//! Epistemic foundation:
//! - K_i: One job is one pass over the plan: each node is evaluated at most
//!   once and shared by every sink downstream of it
//! - K_i: Sinks are written only after every sink's input evaluated cleanly
//! - B_i: User functions and checkpoint reads may fail → ExecutionFailure
//! - I^B: Sink storage may fail → surfaced unchanged (StorageWriteFailure)

use super::graph::{Collection, NodeId, NodeKind, PlanNode};
use crate::codec::RecordReader;
use crate::models::{Result, StagepointError, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Destination for the records of one collection in a job.
pub trait RecordSink: Send {
    fn write(&mut self, record: &Value) -> Result<()>;

    /// Complete the sink. Returns the number of records it received.
    fn finish(self: Box<Self>) -> Result<u64>;

    /// Called instead of `finish` when the job fails before this sink completes.
    fn abandon(self: Box<Self>) {}
}

/// A set of collections to materialize together.
pub struct Job {
    id: Uuid,
    sinks: Vec<(Collection, Box<dyn RecordSink>)>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl Job {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            sinks: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach a sink that receives every record of `collection`.
    pub fn add_sink(&mut self, collection: Collection, sink: Box<dyn RecordSink>) {
        self.sinks.push((collection, sink));
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

/// Outcome of a successful job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    /// Distinct plan nodes evaluated
    pub nodes_evaluated: usize,
    /// Records written per sink, in sink order
    pub records_written: Vec<u64>,
    pub elapsed: Duration,
}

/// Engine that runs jobs as single coordinated executions.
pub trait Executor: Send + Sync + fmt::Debug {
    fn execute(&self, job: Job) -> Result<JobReport>;
}

/// In-process executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

type Evaluated = HashMap<NodeId, Arc<Vec<Value>>>;

impl Executor for LocalExecutor {
    fn execute(&self, job: Job) -> Result<JobReport> {
        let started = Instant::now();
        let Job { id, sinks } = job;
        info!(job_id = %id, sinks = sinks.len(), "Job started");

        let mut evaluated = Evaluated::new();
        let evaluation: Result<Vec<_>> = sinks
            .iter()
            .map(|(collection, _)| evaluate(&collection.node, &mut evaluated))
            .collect();
        let outputs = match evaluation {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job failed during evaluation");
                sinks.into_iter().for_each(|(_, sink)| sink.abandon());
                return Err(e);
            }
        };

        let mut records_written = Vec::with_capacity(sinks.len());
        let mut pending = sinks.into_iter().zip(outputs);
        while let Some(((_, mut sink), records)) = pending.next() {
            let written = records
                .iter()
                .try_for_each(|record| sink.write(record))
                .and_then(|()| sink.finish());
            match written {
                Ok(count) => records_written.push(count),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Job failed while writing sinks");
                    pending.for_each(|((_, sink), _)| sink.abandon());
                    return Err(e);
                }
            }
        }

        let report = JobReport {
            job_id: id,
            nodes_evaluated: evaluated.len(),
            records_written,
            elapsed: started.elapsed(),
        };
        info!(
            job_id = %id,
            nodes = report.nodes_evaluated,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Job completed"
        );
        Ok(report)
    }
}

/// Evaluate `root` and its ancestors, reusing anything already in `evaluated`.
///
/// Walks the plan with an explicit stack so long chains do not recurse.
fn evaluate(root: &Arc<PlanNode>, evaluated: &mut Evaluated) -> Result<Arc<Vec<Value>>> {
    let mut stack = vec![Arc::clone(root)];
    while let Some(node) = stack.last().cloned() {
        if evaluated.contains_key(&node.id) {
            stack.pop();
            continue;
        }
        if let Some(input) = node.kind.input() {
            if !evaluated.contains_key(&input.node.id) {
                stack.push(Arc::clone(&input.node));
                continue;
            }
        }
        let records = evaluate_node(&node, evaluated).map_err(|e| as_execution(&node, e))?;
        debug!(node = node.id, records = records.len(), "Node evaluated");
        evaluated.insert(node.id, records);
        stack.pop();
    }

    evaluated
        .get(&root.id)
        .cloned()
        .ok_or_else(|| StagepointError::Internal(format!("node {} was not evaluated", root.id)))
}

fn input_records(input: &Collection, evaluated: &Evaluated) -> Result<Arc<Vec<Value>>> {
    evaluated.get(&input.node.id).cloned().ok_or_else(|| {
        StagepointError::Internal(format!("input node {} evaluated out of order", input.node.id))
    })
}

fn evaluate_node(node: &PlanNode, evaluated: &Evaluated) -> Result<Arc<Vec<Value>>> {
    let records = match &node.kind {
        NodeKind::Source(values) => return Ok(Arc::clone(values)),
        NodeKind::Checkpoint { storage, path } => {
            let reader = RecordReader::new(storage.open(path)?, node.descriptor.clone())?;
            reader.collect::<Result<Vec<_>>>()?
        }
        NodeKind::Map { input, f } => {
            let mut out = Vec::new();
            for record in input_records(input, evaluated)?.iter() {
                let mapped = f(record)?;
                if !mapped.conforms_to(node.descriptor.root()) {
                    return Err(StagepointError::Execution(format!(
                        "map produced {mapped}, which does not conform to {}",
                        node.descriptor
                    )));
                }
                out.push(mapped);
            }
            out
        }
        NodeKind::Filter { input, predicate } => {
            let mut out = Vec::new();
            for record in input_records(input, evaluated)?.iter() {
                if predicate(record)? {
                    out.push(record.clone());
                }
            }
            out
        }
        NodeKind::Select { input, assembler } => input_records(input, evaluated)?
            .iter()
            .map(|record| assembler.apply(record))
            .collect::<Result<Vec<_>>>()?,
    };
    Ok(Arc::new(records))
}

fn as_execution(node: &PlanNode, error: StagepointError) -> StagepointError {
    match error {
        StagepointError::Execution(_) => error,
        other => StagepointError::Execution(format!(
            "{} node {} failed: {other}",
            node.kind.label(),
            node.id
        )),
    }
}

/// Sink that keeps records in memory; see `Collection::collect`.
pub struct MemorySink {
    records: Vec<Value>,
    shared: Arc<Mutex<Vec<Value>>>,
}

/// Records received by a finished `MemorySink`.
#[derive(Debug, Clone)]
pub struct MemoryRecords(Arc<Mutex<Vec<Value>>>);

impl MemorySink {
    pub fn new() -> (Self, MemoryRecords) {
        let shared = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                records: Vec::new(),
                shared: Arc::clone(&shared),
            },
            MemoryRecords(shared),
        )
    }
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &Value) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let count = self.records.len() as u64;
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| StagepointError::Internal("memory sink lock poisoned".to_string()))?;
        *shared = self.records;
        Ok(count)
    }
}

impl MemoryRecords {
    /// Take the collected records, leaving the handle empty.
    pub fn take(&self) -> Result<Vec<Value>> {
        let mut records = self
            .0
            .lock()
            .map_err(|_| StagepointError::Internal("memory sink lock poisoned".to_string()))?;
        Ok(std::mem::take(&mut *records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataType, TypeDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ints() -> TypeDescriptor {
        TypeDescriptor::scalar(DataType::Int64)
    }

    fn source(values: &[i64]) -> Collection {
        Collection::from_values(ints(), values.iter().map(|v| Value::Int64(*v)).collect()).unwrap()
    }

    #[test]
    fn test_map_and_filter() {
        let doubled = source(&[1, 2, 3, 4]).map(ints(), |v| {
            Ok(Value::Int64(v.as_i64().unwrap_or_default() * 2))
        });
        let big = doubled.filter(|v| Ok(v.as_i64().unwrap_or_default() > 4));
        assert_eq!(
            big.collect(&LocalExecutor).unwrap(),
            vec![Value::Int64(6), Value::Int64(8)]
        );
    }

    #[test]
    fn test_shared_ancestor_evaluated_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let shared = source(&[1, 2, 3]).map(ints(), move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(v.clone())
        });
        let left = shared.map(ints(), |v| Ok(v.clone()));
        let right = shared.filter(|_| Ok(true));

        let (left_sink, left_out) = MemorySink::new();
        let (right_sink, right_out) = MemorySink::new();
        let mut job = Job::new();
        job.add_sink(left, Box::new(left_sink));
        job.add_sink(right, Box::new(right_sink));
        let report = LocalExecutor.execute(job).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.nodes_evaluated, 4);
        assert_eq!(report.records_written, vec![3, 3]);
        assert_eq!(left_out.take().unwrap().len(), 3);
        assert_eq!(right_out.take().unwrap().len(), 3);
    }

    #[test]
    fn test_user_failure_is_execution_error() {
        let failing = source(&[1]).map(ints(), |_| {
            Err(StagepointError::InvalidInput("bad row".to_string()))
        });
        let err = failing.collect(&LocalExecutor).unwrap_err();
        assert!(matches!(err, StagepointError::Execution(_)));
    }

    #[test]
    fn test_nonconforming_map_output_fails_job() {
        let wrong = source(&[1]).map(ints(), |_| Ok(Value::Utf8("x".into())));
        let err = wrong.collect(&LocalExecutor).unwrap_err();
        assert!(matches!(err, StagepointError::Execution(_)));
    }

    #[test]
    fn test_failed_job_abandons_every_sink() {
        struct Tracking(Arc<AtomicUsize>);
        impl RecordSink for Tracking {
            fn write(&mut self, _: &Value) -> Result<()> {
                Ok(())
            }
            fn finish(self: Box<Self>) -> Result<u64> {
                Ok(0)
            }
            fn abandon(self: Box<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let abandoned = Arc::new(AtomicUsize::new(0));
        let mut job = Job::new();
        job.add_sink(source(&[1]), Box::new(Tracking(Arc::clone(&abandoned))));
        job.add_sink(
            source(&[1]).map(ints(), |_| Err(StagepointError::Execution("boom".into()))),
            Box::new(Tracking(Arc::clone(&abandoned))),
        );
        assert!(LocalExecutor.execute(job).is_err());
        assert_eq!(abandoned.load(Ordering::SeqCst), 2);
    }
}
