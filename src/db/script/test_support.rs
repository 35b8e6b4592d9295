//! Scriptable in-memory connection and a recording event handler.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::db::connection::{
    ColumnInfo, ConnectionFactory, ConnectionInfo, DbCommand, DbConnection, DbError,
    InfoMessageHandler, ResultReader, ServerError,
};

use super::{
    Batch, BatchEventHandler, ScriptEventHandler, ScriptExecutionResult, ScriptMessageKind,
    ShowPlanKind, SqlCmdCommand, TextSpan,
};

#[derive(Clone, Default)]
pub struct FakeResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl FakeResultSet {
    pub fn new(columns: &[&str], rows: &[&[&str]]) -> Self {
        Self {
            columns: columns.iter().map(|name| name.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|value| Some(value.to_string())).collect())
                .collect(),
        }
    }

    /// A zero-column set that only carried messages.
    pub fn messages_only() -> Self {
        Self::default()
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// What the fake server does with one command.
#[derive(Clone, Default)]
pub struct FakeResponse {
    pub messages: Vec<ServerError>,
    pub server_errors: Vec<ServerError>,
    pub driver_error: Option<String>,
    pub result_sets: Vec<FakeResultSet>,
    pub rows_affected: Option<u64>,
    pub close_connection: bool,
    pub block_until_cancel: bool,
    pub on_execute: Option<Hook>,
}

impl FakeResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn rows(count: u64) -> Self {
        Self {
            rows_affected: Some(count),
            ..Self::default()
        }
    }

    pub fn result_set(set: FakeResultSet) -> Self {
        Self {
            result_sets: vec![set],
            ..Self::default()
        }
    }

    pub fn server_error(error: ServerError) -> Self {
        Self {
            server_errors: vec![error],
            ..Self::default()
        }
    }

    pub fn driver_error(message: &str) -> Self {
        Self {
            driver_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: ServerError) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_result_set(mut self, set: FakeResultSet) -> Self {
        self.result_sets.push(set);
        self
    }

    pub fn closing_connection(mut self) -> Self {
        self.close_connection = true;
        self
    }

    pub fn blocking_until_cancel(mut self) -> Self {
        self.block_until_cancel = true;
        self
    }

    pub fn on_execute(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(hook));
        self
    }
}

#[derive(Default)]
struct Shared {
    open: AtomicBool,
    closed_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    info_handler: Mutex<Option<InfoMessageHandler>>,
    fail_create: Mutex<Option<String>>,
}

impl Shared {
    /// Queued responses are consumed in order; the last one repeats.
    fn response_for(&self, text: &str) -> FakeResponse {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(text.trim()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => FakeResponse::ok(),
        }
    }

    fn send_messages(&self, messages: &[ServerError]) {
        if messages.is_empty() {
            return;
        }
        let handler = self.info_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(messages);
        }
    }
}

pub struct FakeConnection {
    shared: Arc<Shared>,
    version: u32,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Self::with_version(16)
    }

    pub fn with_version(version: u32) -> Arc<Self> {
        let shared = Shared::default();
        shared.open.store(true, Ordering::SeqCst);
        Arc::new(Self {
            shared: Arc::new(shared),
            version,
        })
    }

    pub fn respond(&self, text: &str, response: FakeResponse) {
        self.respond_sequence(text, vec![response]);
    }

    pub fn respond_sequence(&self, text: &str, responses: Vec<FakeResponse>) {
        self.shared
            .responses
            .lock()
            .unwrap()
            .insert(text.trim().to_string(), responses.into());
    }

    pub fn fail_create_command(&self, message: &str) {
        *self.shared.fail_create.lock().unwrap() = Some(message.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.shared.executed.lock().unwrap().clone()
    }

    pub fn closed_calls(&self) -> usize {
        self.shared.closed_calls.load(Ordering::SeqCst)
    }

    pub fn has_info_handler(&self) -> bool {
        self.shared.info_handler.lock().unwrap().is_some()
    }
}

impl DbConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn server_major_version(&self) -> u32 {
        self.version
    }

    fn create_command(&self, text: &str, _timeout_secs: u32) -> Result<Arc<dyn DbCommand>, DbError> {
        if let Some(message) = self.shared.fail_create.lock().unwrap().clone() {
            return Err(DbError::Driver(message));
        }
        if !self.is_open() {
            return Err(DbError::ConnectionClosed);
        }
        Ok(Arc::new(FakeCommand {
            text: text.to_string(),
            shared: Arc::clone(&self.shared),
            cancelled: Mutex::new(false),
            cancel_signal: Condvar::new(),
        }))
    }

    fn set_info_message_handler(&self, handler: Option<InfoMessageHandler>) {
        *self.shared.info_handler.lock().unwrap() = handler;
    }

    fn close(&self) -> Result<(), DbError> {
        self.shared.closed_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeCommand {
    text: String,
    shared: Arc<Shared>,
    cancelled: Mutex<bool>,
    cancel_signal: Condvar,
}

impl FakeCommand {
    fn run(&self) -> Result<FakeResponse, DbError> {
        self.shared.executed.lock().unwrap().push(self.text.clone());
        let response = self.shared.response_for(&self.text);

        if let Some(hook) = &response.on_execute {
            hook();
        }
        self.shared.send_messages(&response.messages);

        if response.block_until_cancel {
            let mut cancelled = self.cancelled.lock().unwrap();
            while !*cancelled {
                cancelled = self.cancel_signal.wait(cancelled).unwrap();
            }
        }
        if *self.cancelled.lock().unwrap() {
            return Err(DbError::Cancelled);
        }
        if response.close_connection {
            self.shared.open.store(false, Ordering::SeqCst);
        }
        if !response.server_errors.is_empty() {
            return Err(DbError::Server(response.server_errors.clone()));
        }
        if let Some(message) = &response.driver_error {
            return Err(DbError::Driver(message.clone()));
        }
        Ok(response)
    }
}

impl DbCommand for FakeCommand {
    fn execute_non_query(&self) -> Result<Option<u64>, DbError> {
        self.run().map(|response| response.rows_affected)
    }

    fn execute_reader(&self) -> Result<Box<dyn ResultReader + '_>, DbError> {
        let response = self.run()?;
        Ok(Box::new(FakeReader {
            sets: response.result_sets,
            current: 0,
            row: None,
            rows_affected: response.rows_affected,
        }))
    }

    fn cancel(&self) -> Result<(), DbError> {
        *self.cancelled.lock().unwrap() = true;
        self.cancel_signal.notify_all();
        Ok(())
    }
}

pub struct FakeReader {
    sets: Vec<FakeResultSet>,
    current: usize,
    row: Option<usize>,
    rows_affected: Option<u64>,
}

impl FakeReader {
    fn current_set(&self) -> Option<&FakeResultSet> {
        self.sets.get(self.current)
    }
}

impl ResultReader for FakeReader {
    fn field_count(&self) -> usize {
        self.current_set().map_or(0, |set| set.columns.len())
    }

    fn columns(&self) -> Vec<ColumnInfo> {
        self.current_set()
            .map(|set| {
                set.columns
                    .iter()
                    .map(|name| ColumnInfo {
                        name: name.clone(),
                        data_type: "nvarchar".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read(&mut self) -> Result<bool, DbError> {
        let Some(total) = self.current_set().map(|set| set.rows.len()) else {
            return Ok(false);
        };
        let next = self.row.map_or(0, |row| row + 1);
        if next < total {
            self.row = Some(next);
            Ok(true)
        } else {
            self.row = Some(total);
            Ok(false)
        }
    }

    fn get_string(&self, index: usize) -> Option<String> {
        let set = self.current_set()?;
        set.rows.get(self.row?)?.get(index)?.clone()
    }

    fn next_result(&mut self) -> Result<bool, DbError> {
        self.current += 1;
        self.row = None;
        Ok(self.current < self.sets.len())
    }

    fn records_affected(&self) -> Option<u64> {
        self.rows_affected
    }
}

/// Hands out pre-built connections for `:connect`.
pub struct FakeConnectionFactory {
    pub connection: Arc<FakeConnection>,
    pub requests: Mutex<Vec<ConnectionInfo>>,
    pub refuse: bool,
}

impl FakeConnectionFactory {
    pub fn new(connection: Arc<FakeConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            requests: Mutex::new(Vec::new()),
            refuse: false,
        })
    }
}

impl ConnectionFactory for FakeConnectionFactory {
    fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn DbConnection>, DbError> {
        self.requests.lock().unwrap().push(info.clone());
        if self.refuse {
            return Err(DbError::Driver("login failed".to_string()));
        }
        self.connection.shared.open.store(true, Ordering::SeqCst);
        let connection: Arc<dyn DbConnection> = self.connection.clone();
        Ok(connection)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Error {
        message: String,
        number: Option<i32>,
        span: TextSpan,
    },
    Message {
        detailed: Option<String>,
        message: String,
        has_raw: bool,
    },
    ResultSet {
        rows: Vec<Vec<Option<String>>>,
        show_plan: ShowPlanKind,
    },
    ResultSetFinished,
    Cancelling,
    BatchStarted {
        index: usize,
        text: String,
        tracking_id: u32,
    },
    BatchFinished {
        text: String,
        result: ScriptExecutionResult,
        command: Option<SqlCmdCommand>,
    },
    ScriptMessage {
        message: String,
        kind: ScriptMessageKind,
        span: TextSpan,
    },
    ScriptFinished(ScriptExecutionResult),
}

/// Records every batch and script event in order.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
    result_set_outcome: Mutex<Option<ScriptExecutionResult>>,
    on_batch_started: Mutex<Option<Hook>>,
    on_result_set: Mutex<Option<Hook>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Message { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn script_messages(&self) -> Vec<(String, ScriptMessageKind)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::ScriptMessage { message, kind, .. } => Some((message, kind)),
                _ => None,
            })
            .collect()
    }

    pub fn finished_batches(&self) -> Vec<(String, ScriptExecutionResult)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::BatchFinished { text, result, .. } => Some((text, result)),
                _ => None,
            })
            .collect()
    }

    pub fn script_finished(&self) -> Option<ScriptExecutionResult> {
        self.events().into_iter().find_map(|event| match event {
            Event::ScriptFinished(result) => Some(result),
            _ => None,
        })
    }

    /// Make the result-set consumer stop the batch with `outcome`.
    pub fn stop_result_sets_with(&self, outcome: ScriptExecutionResult) {
        *self.result_set_outcome.lock().unwrap() = Some(outcome);
    }

    pub fn set_on_batch_started(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_batch_started.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Runs after each result set was drained.
    pub fn set_on_result_set(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_result_set.lock().unwrap() = Some(Arc::new(hook));
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl BatchEventHandler for RecordingEvents {
    fn on_batch_error(&self, message: &str, error: Option<&ServerError>, span: TextSpan) {
        self.push(Event::Error {
            message: message.to_string(),
            number: error.map(|error| error.number),
            span,
        });
    }

    fn on_batch_message(&self, detailed: Option<&str>, message: &str, error: Option<&ServerError>) {
        self.push(Event::Message {
            detailed: detailed.map(str::to_string),
            message: message.to_string(),
            has_raw: error.is_some(),
        });
    }

    fn on_result_set(
        &self,
        reader: &mut dyn ResultReader,
        show_plan: ShowPlanKind,
    ) -> Result<ScriptExecutionResult, DbError> {
        let mut rows = Vec::new();
        while reader.read()? {
            rows.push(
                (0..reader.field_count())
                    .map(|index| reader.get_string(index))
                    .collect(),
            );
        }
        self.push(Event::ResultSet { rows, show_plan });
        let hook = self.on_result_set.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        let outcome = *self.result_set_outcome.lock().unwrap();
        Ok(outcome.unwrap_or(ScriptExecutionResult::Success))
    }

    fn on_result_set_finished(&self) {
        self.push(Event::ResultSetFinished);
    }

    fn on_cancelling(&self) {
        self.push(Event::Cancelling);
    }
}

impl ScriptEventHandler for RecordingEvents {
    fn on_batch_started(&self, batch: &Batch) {
        self.push(Event::BatchStarted {
            index: batch.index(),
            text: batch.text().to_string(),
            tracking_id: batch.script_tracking_id(),
        });
        let hook = self.on_batch_started.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn on_batch_finished(
        &self,
        batch: &Batch,
        result: ScriptExecutionResult,
        command: Option<SqlCmdCommand>,
    ) {
        self.push(Event::BatchFinished {
            text: batch.text().to_string(),
            result,
            command,
        });
    }

    fn on_script_parse_error(&self, message: &str, kind: ScriptMessageKind, span: TextSpan) {
        self.push(Event::ScriptMessage {
            message: message.to_string(),
            kind,
            span,
        });
    }

    fn on_script_finished(&self, result: ScriptExecutionResult, _elapsed: chrono::Duration) {
        self.push(Event::ScriptFinished(result));
    }
}
