//! In-memory collaborators for exercising pipelines without Kafka, Postgres or HTTP.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::checkpoint::CheckpointStore;
use crate::error::{CheckpointError, OperationError, RowSourceError, SinkError, SourceError};
use crate::event::{AssembledOutput, Event, IdType, KeyValue};
use crate::sink::Sink;
use crate::source::EventSource;
use crate::strategy::{RemoteCall, Row, RowSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    /// The sink acknowledged the output of this event.
    Delivered(u64),
    /// The checkpoint store was advanced to this position.
    Advanced(u64),
}

/// Interleaved record of sink acknowledgments and checkpoint advances.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: JournalEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }
}

pub type ReadLog = Arc<Mutex<Vec<(u64, Instant)>>>;

/// A finite upstream. Events may be scheduled to arrive at fixed offsets from creation.
pub struct VecSource {
    events: VecDeque<(Option<Duration>, Event)>,
    started: Instant,
    fail_at: Option<u64>,
    reads: ReadLog,
}

impl VecSource {
    /// Assigns eids from 0 in order.
    pub fn new(payloads: Vec<Value>) -> Self {
        Self::from_events(
            payloads
                .into_iter()
                .enumerate()
                .map(|(eid, payload)| Event::new(eid as u64, payload))
                .collect(),
        )
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        Self {
            events: events.into_iter().map(|event| (None, event)).collect(),
            started: Instant::now(),
            fail_at: None,
            reads: ReadLog::default(),
        }
    }

    /// Resume after `position`, as a restarted reader would.
    pub fn read_from(mut self, position: Option<u64>) -> Self {
        if let Some(position) = position {
            self.events.retain(|(_, event)| event.eid > position);
        }
        self
    }

    /// Delay each event until its offset from the source's creation.
    pub fn arriving_at(mut self, offsets: Vec<Duration>) -> Self {
        for ((arrival, _), offset) in self.events.iter_mut().zip(offsets) {
            *arrival = Some(offset);
        }
        self
    }

    /// Fail instead of yielding the event with this eid.
    pub fn failing_at(mut self, eid: u64) -> Self {
        self.fail_at = Some(eid);
        self
    }

    /// Eids in the order they were read, with the instant each was handed out.
    pub fn read_log(&self) -> ReadLog {
        self.reads.clone()
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn next_event(&mut self) -> Option<Result<Event, SourceError>> {
        let (arrival, eid) = self.events.front().map(|(a, e)| (*a, e.eid))?;
        if let Some(offset) = arrival {
            tokio::time::sleep_until(self.started + offset).await;
        }
        if self.fail_at == Some(eid) {
            return Some(Err(SourceError::Read(format!("corrupt record at {eid}"))));
        }

        let (_, event) = self.events.pop_front()?;
        self.reads.lock().unwrap().push((eid, Instant::now()));
        Some(Ok(event))
    }
}

#[derive(Debug, Default)]
struct SinkState {
    written: Vec<AssembledOutput>,
    acknowledged: usize,
    max_pending: usize,
    backpressure_waits: usize,
    flushed_at: Vec<Instant>,
    fail_flush: bool,
    stall_flush: bool,
}

impl SinkState {
    fn pending(&self) -> usize {
        self.written.len() - self.acknowledged
    }

    fn acknowledge(&mut self, journal: Option<&Journal>) {
        if let Some(journal) = journal {
            for output in &self.written[self.acknowledged..] {
                journal.push(JournalEntry::Delivered(output.eid()));
            }
        }
        self.acknowledged = self.written.len();
    }
}

/// Records every write. Asks for a pause once `capacity` writes are unacknowledged; waiting
/// on `ready` or flushing acknowledges them.
pub struct RecordingSink {
    capacity: usize,
    ready_after: Option<Duration>,
    state: Arc<Mutex<SinkState>>,
    journal: Option<Journal>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ready_after: None,
            state: Arc::default(),
            journal: None,
        }
    }

    /// Take this long to acknowledge pending writes when waited on.
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_after = Some(delay);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write(&mut self, output: AssembledOutput) -> Result<bool, SinkError> {
        let mut state = self.state.lock().unwrap();
        state.written.push(output);
        state.max_pending = state.max_pending.max(state.pending());
        Ok(state.pending() < self.capacity)
    }

    async fn ready(&mut self) -> Result<(), SinkError> {
        match self.ready_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        let mut state = self.state.lock().unwrap();
        state.backpressure_waits += 1;
        state.acknowledge(self.journal.as_ref());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let (stall, fail) = {
            let state = self.state.lock().unwrap();
            (state.stall_flush, state.fail_flush)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(SinkError::Flush("downstream unavailable".to_owned()));
        }

        let mut state = self.state.lock().unwrap();
        state.acknowledge(self.journal.as_ref());
        state.flushed_at.push(Instant::now());
        Ok(())
    }
}

/// Shared view of a `RecordingSink` that outlives the pipeline owning it.
#[derive(Clone)]
pub struct SinkHandle {
    state: Arc<Mutex<SinkState>>,
}

impl SinkHandle {
    pub fn written(&self) -> Vec<AssembledOutput> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn written_eids(&self) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .written
            .iter()
            .map(AssembledOutput::eid)
            .collect()
    }

    pub fn max_pending(&self) -> usize {
        self.state.lock().unwrap().max_pending
    }

    pub fn backpressure_waits(&self) -> usize {
        self.state.lock().unwrap().backpressure_waits
    }

    pub fn flushed_at(&self) -> Vec<Instant> {
        self.state.lock().unwrap().flushed_at.clone()
    }

    pub fn fail_flushes(&self, fail: bool) {
        self.state.lock().unwrap().fail_flush = fail;
    }

    /// Make every following flush hang forever.
    pub fn stall_flushes(&self, stall: bool) {
        self.state.lock().unwrap().stall_flush = stall;
    }
}

#[derive(Debug, Default)]
struct CheckpointState {
    advanced: Vec<u64>,
    finished: u32,
}

#[derive(Default)]
pub struct MemoryCheckpoint {
    state: Arc<Mutex<CheckpointState>>,
    journal: Option<Journal>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn advance(&mut self, position: u64) -> Result<(), CheckpointError> {
        self.state.lock().unwrap().advanced.push(position);
        if let Some(journal) = &self.journal {
            journal.push(JournalEntry::Advanced(position));
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CheckpointError> {
        self.state.lock().unwrap().finished += 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct CheckpointHandle {
    state: Arc<Mutex<CheckpointState>>,
}

impl CheckpointHandle {
    pub fn advanced(&self) -> Vec<u64> {
        self.state.lock().unwrap().advanced.clone()
    }

    pub fn position(&self) -> Option<u64> {
        self.state.lock().unwrap().advanced.last().copied()
    }

    pub fn finished(&self) -> u32 {
        self.state.lock().unwrap().finished
    }
}

/// Canned query results. Each registered query returns the rows whose `key_column`, read as
/// the bound id type, is among the bound ids.
#[derive(Default)]
pub struct StaticRows {
    tables: HashMap<String, (String, Vec<Row>)>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, IdType, Vec<KeyValue>)>>,
}

impl StaticRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, sql: &str, key_column: &str, rows: Vec<Row>) -> Self {
        self.tables
            .insert(sql.to_owned(), (key_column.to_owned(), rows));
        self
    }

    pub fn failing(mut self, sql: &str) -> Self {
        self.failing.insert(sql.to_owned());
        self
    }

    pub fn delay(mut self, sql: &str, delay: Duration) -> Self {
        self.delays.insert(sql.to_owned(), delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, IdType, Vec<KeyValue>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, sql: &str) -> Vec<Vec<KeyValue>> {
        self.calls()
            .into_iter()
            .filter(|(called, _, _)| called == sql)
            .map(|(_, _, ids)| ids)
            .collect()
    }

    pub fn id_types_for(&self, sql: &str) -> Vec<IdType> {
        self.calls()
            .into_iter()
            .filter(|(called, _, _)| called == sql)
            .map(|(_, id_type, _)| id_type)
            .collect()
    }
}

#[async_trait]
impl RowSource for StaticRows {
    async fn fetch_rows(
        &self,
        sql: &str,
        id_type: IdType,
        ids: &[KeyValue],
    ) -> Result<Vec<Row>, RowSourceError> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_owned(), id_type, ids.to_vec()));

        if let Some(delay) = self.delays.get(sql) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(sql) {
            return Err(RowSourceError::Query("connection reset by peer".to_owned()));
        }

        let Some((key_column, rows)) = self.tables.get(sql) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| {
                row.get(key_column)
                    .and_then(KeyValue::from_json)
                    .and_then(|key| id_type.coerce(&key))
                    .is_some_and(|key| ids.contains(&key))
            })
            .cloned()
            .collect())
    }
}

/// A remote endpoint answering `{"echo": payload}`, after scripted delays and failures.
#[derive(Default)]
pub struct ScriptedCall {
    failures: Mutex<HashMap<u64, u32>>,
    permanent: HashSet<u64>,
    delays: HashMap<u64, Duration>,
    calls: Mutex<Vec<(u64, Instant)>>,
}

impl ScriptedCall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` calls for `eid` with a transient error.
    pub fn fail_times(self, eid: u64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(eid, times);
        self
    }

    pub fn fail_permanently(mut self, eid: u64) -> Self {
        self.permanent.insert(eid);
        self
    }

    pub fn delay(mut self, eid: u64, delay: Duration) -> Self {
        self.delays.insert(eid, delay);
        self
    }

    pub fn calls(&self) -> Vec<(u64, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    /// When each call for `eid` started.
    pub fn calls_for(&self, eid: u64) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter(|(called, _)| *called == eid)
            .map(|(_, at)| at)
            .collect()
    }
}

#[async_trait]
impl RemoteCall for ScriptedCall {
    async fn call(&self, event: &Event) -> Result<Value, OperationError> {
        self.calls.lock().unwrap().push((event.eid, Instant::now()));

        if let Some(delay) = self.delays.get(&event.eid) {
            tokio::time::sleep(*delay).await;
        }
        if self.permanent.contains(&event.eid) {
            return Err(OperationError::Permanent(format!("rejected {}", event.eid)));
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&event.eid).filter(|r| **r > 0) {
                *remaining -= 1;
                return Err(OperationError::transient("scripted failure"));
            }
        }

        Ok(json!({ "echo": event.payload }))
    }
}
