use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::db::connection::{
    lock_or_recover, DbCommand, DbConnection, DbError, InfoMessageHandler, ResultReader,
    ServerError,
};

use super::{BatchState, ScriptExecutionResult, ShowPlanKind, TextSpan};

/// "Changed database context to ..." is noise for script output.
pub const CHANGE_DATABASE_MESSAGE: i32 = 5701;

/// Observer for everything a batch reports while it executes.
///
/// All callbacks except [`BatchEventHandler::on_cancelling`] run on the thread
/// that called [`Batch::execute`]. `on_cancelling` runs on whichever thread
/// requested the cancel.
pub trait BatchEventHandler: Send + Sync {
    /// An error-class server message, or a failure raised by the driver.
    fn on_batch_error(&self, _message: &str, _error: Option<&ServerError>, _span: TextSpan) {}

    /// An informational message. `detailed` carries the formatted
    /// `Msg/Level/State` header when one applies. `error` is `None` for
    /// messages produced by the engine itself.
    fn on_batch_message(
        &self,
        _detailed: Option<&str>,
        _message: &str,
        _error: Option<&ServerError>,
    ) {
    }

    /// A result set with at least one column is ready. The batch does not
    /// continue until this returns. Returning anything other than `Success`
    /// stops the batch with that outcome.
    fn on_result_set(
        &self,
        reader: &mut dyn ResultReader,
        _show_plan: ShowPlanKind,
    ) -> Result<ScriptExecutionResult, DbError> {
        while reader.read()? {}
        Ok(ScriptExecutionResult::Success)
    }

    fn on_result_set_finished(&self) {}

    fn on_cancelling(&self) {}
}

/// Header line for a server message, or `None` when the message should be
/// shown as plain text.
pub fn format_server_message(error: &ServerError, span: TextSpan) -> Option<String> {
    if !(error.class > 10 || (error.class > 0 && error.number != 0)) {
        return None;
    }

    let header = if error.line_number == 0 {
        format!(
            "Msg {}, Level {}, State {}",
            error.number, error.class, error.state
        )
    } else {
        // Server line numbers are relative to the batch.
        let line = error.line_number as usize + span.start_line.saturating_sub(1);
        match error.procedure.as_deref().filter(|name| !name.is_empty()) {
            Some(procedure) => format!(
                "Msg {}, Level {}, State {}, Procedure {}, Line {}",
                error.number, error.class, error.state, procedure, line
            ),
            None => format!(
                "Msg {}, Level {}, State {}, Line {}",
                error.number, error.class, error.state, line
            ),
        }
    };

    Some(format!("{}\n{}", header, error.message))
}

pub fn rows_affected_message(rows: u64) -> String {
    if rows == 1 {
        "(1 row affected)".to_string()
    } else {
        format!("({} rows affected)", rows)
    }
}

/// Routes server messages for one execution to the event handler.
#[derive(Clone)]
struct MessageRouter {
    handler: Option<Arc<dyn BatchEventHandler>>,
    span: TextSpan,
    suppress_headers: bool,
    has_errors: Arc<AtomicBool>,
}

impl MessageRouter {
    fn route(&self, errors: &[ServerError]) {
        for error in errors {
            self.route_one(error);
        }
    }

    fn route_one(&self, error: &ServerError) {
        if error.number == CHANGE_DATABASE_MESSAGE {
            return;
        }

        let detailed = format_server_message(error, self.span);
        if error.is_error() {
            self.has_errors.store(true, Ordering::SeqCst);
            if let Some(handler) = &self.handler {
                let text = detailed.unwrap_or_else(|| error.message.clone());
                handler.on_batch_error(&text, Some(error), self.span);
            }
        } else if let Some(handler) = &self.handler {
            let detailed = if self.suppress_headers { None } else { detailed };
            handler.on_batch_message(detailed.as_deref(), &error.message, Some(error));
        }
    }

    fn raise_error(&self, message: &str) {
        self.has_errors.store(true, Ordering::SeqCst);
        if let Some(handler) = &self.handler {
            handler.on_batch_error(message, None, self.span);
        }
    }

    fn raise_message(&self, message: &str) {
        if let Some(handler) = &self.handler {
            handler.on_batch_message(None, message, None);
        }
    }
}

struct BatchRuntime {
    state: BatchState,
    command: Option<Arc<dyn DbCommand>>,
}

/// State shared between the executing thread and cancel requests.
struct BatchControl {
    runtime: Mutex<BatchRuntime>,
    handler: Option<Arc<dyn BatchEventHandler>>,
}

impl BatchControl {
    fn new(handler: Option<Arc<dyn BatchEventHandler>>) -> Self {
        Self {
            runtime: Mutex::new(BatchRuntime {
                state: BatchState::Initial,
                command: None,
            }),
            handler,
        }
    }

    fn state(&self) -> BatchState {
        lock_or_recover(&self.runtime, "batch state").state
    }

    fn is_cancelling(&self) -> bool {
        self.state() == BatchState::Cancelling
    }

    fn cancel(&self) {
        let command = {
            let mut runtime = lock_or_recover(&self.runtime, "batch state");
            if runtime.state == BatchState::Cancelling {
                return;
            }
            runtime.state = BatchState::Cancelling;
            runtime.command.clone()
        };

        tracing::debug!("batch cancel requested");
        if let Some(handler) = &self.handler {
            handler.on_cancelling();
        }

        if let Some(command) = command {
            if let Err(err) = command.cancel() {
                tracing::warn!("failed to cancel running command: {err}");
            }
        }
    }
}

/// Cancels a batch from another thread.
#[derive(Clone)]
pub struct BatchCancelHandle {
    control: Arc<BatchControl>,
}

impl BatchCancelHandle {
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn state(&self) -> BatchState {
        self.control.state()
    }
}

/// One executable unit of script text.
pub struct Batch {
    text: String,
    span: TextSpan,
    index: usize,
    script_tracking_id: u32,
    is_results_expected: bool,
    execution_timeout: u32,
    expected_execution_count: u32,
    suppress_provider_message_headers: bool,
    rows_affected: Option<u64>,
    has_errors: Arc<AtomicBool>,
    control: Arc<BatchControl>,
}

impl Batch {
    pub fn new(text: &str, is_results_expected: bool, execution_timeout: u32) -> Self {
        Self {
            text: text.to_string(),
            span: TextSpan::default(),
            index: 0,
            script_tracking_id: 0,
            is_results_expected,
            execution_timeout,
            expected_execution_count: 1,
            suppress_provider_message_headers: false,
            rows_affected: None,
            has_errors: Arc::new(AtomicBool::new(false)),
            control: Arc::new(BatchControl::new(None)),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn BatchEventHandler>) -> Self {
        self.control = Arc::new(BatchControl::new(Some(handler)));
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    pub fn span(&self) -> TextSpan {
        self.span
    }

    pub fn set_span(&mut self, span: TextSpan) {
        self.span = span;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// 0 when the run is not tracked.
    pub fn script_tracking_id(&self) -> u32 {
        self.script_tracking_id
    }

    pub fn set_script_tracking_id(&mut self, id: u32) {
        self.script_tracking_id = id;
    }

    pub fn is_results_expected(&self) -> bool {
        self.is_results_expected
    }

    pub fn execution_timeout(&self) -> u32 {
        self.execution_timeout
    }

    pub fn set_execution_timeout(&mut self, seconds: u32) {
        self.execution_timeout = seconds;
    }

    pub fn expected_execution_count(&self) -> u32 {
        self.expected_execution_count
    }

    pub fn set_expected_execution_count(&mut self, count: u32) {
        self.expected_execution_count = count.max(1);
    }

    pub fn set_suppress_provider_message_headers(&mut self, suppress: bool) {
        self.suppress_provider_message_headers = suppress;
    }

    pub fn suppress_provider_message_headers(&self) -> bool {
        self.suppress_provider_message_headers
    }

    /// Only meaningful once the batch reached `Executed`.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Only meaningful once the batch reached `Executed`.
    pub fn has_errors(&self) -> bool {
        self.has_errors.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BatchState {
        self.control.state()
    }

    pub fn cancel_handle(&self) -> BatchCancelHandle {
        BatchCancelHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Back to a freshly constructed batch. The event handler, the
    /// results-expected flag and the timeout are construction-time settings
    /// and survive.
    pub fn reset(&mut self) {
        {
            let mut runtime = lock_or_recover(&self.control.runtime, "batch state");
            runtime.state = BatchState::Initial;
            runtime.command = None;
        }
        self.text.clear();
        self.span = TextSpan::default();
        self.index = 0;
        self.script_tracking_id = 0;
        self.expected_execution_count = 1;
        self.suppress_provider_message_headers = false;
        self.rows_affected = None;
        self.has_errors.store(false, Ordering::SeqCst);
    }

    /// Run the batch text once. Blocks until the server is done, the
    /// execution failed, or a cancel request unwound it.
    pub fn execute(
        &mut self,
        connection: &dyn DbConnection,
        show_plan: ShowPlanKind,
    ) -> ScriptExecutionResult {
        {
            let mut runtime = lock_or_recover(&self.control.runtime, "batch state");
            if runtime.state == BatchState::Cancelling {
                return ScriptExecutionResult::Cancel;
            }
            runtime.state = BatchState::Executing;
        }

        self.rows_affected = None;
        self.has_errors.store(false, Ordering::SeqCst);
        tracing::debug!(index = self.index, "executing batch");

        let router = self.router();
        let result = self.run_command(connection, show_plan, &router);

        let mut runtime = lock_or_recover(&self.control.runtime, "batch state");
        runtime.command = None;
        if runtime.state == BatchState::Cancelling {
            runtime.state = BatchState::Initial;
            tracing::debug!(index = self.index, "batch cancelled");
            return ScriptExecutionResult::Cancel;
        }
        runtime.state = BatchState::Executed;
        tracing::debug!(index = self.index, %result, "batch finished");
        result
    }

    fn router(&self) -> MessageRouter {
        MessageRouter {
            handler: self.control.handler.clone(),
            span: self.span,
            suppress_headers: self.suppress_provider_message_headers,
            has_errors: Arc::clone(&self.has_errors),
        }
    }

    fn is_cancelling(&self) -> bool {
        self.control.is_cancelling()
    }

    fn run_command(
        &mut self,
        connection: &dyn DbConnection,
        show_plan: ShowPlanKind,
        router: &MessageRouter,
    ) -> ScriptExecutionResult {
        let command = match connection.create_command(&self.text, self.execution_timeout) {
            Ok(command) => command,
            Err(err) => return self.handle_db_error(err, router),
        };

        {
            let mut runtime = lock_or_recover(&self.control.runtime, "batch state");
            if runtime.state == BatchState::Cancelling {
                return ScriptExecutionResult::Cancel;
            }
            runtime.command = Some(Arc::clone(&command));
        }

        let messages = router.clone();
        let on_info_message: InfoMessageHandler =
            Arc::new(move |errors: &[ServerError]| messages.route(errors));
        connection.set_info_message_handler(Some(on_info_message));

        let result = if self.is_results_expected {
            self.execute_reader(command.as_ref(), show_plan, router)
        } else {
            self.execute_non_query(command.as_ref(), router)
        };

        connection.set_info_message_handler(None);
        result
    }

    fn execute_non_query(
        &mut self,
        command: &dyn DbCommand,
        router: &MessageRouter,
    ) -> ScriptExecutionResult {
        match command.execute_non_query() {
            Ok(rows) => {
                self.rows_affected = rows;
                self.completion_result(router)
            }
            Err(err) => self.handle_db_error(err, router),
        }
    }

    fn execute_reader(
        &mut self,
        command: &dyn DbCommand,
        show_plan: ShowPlanKind,
        router: &MessageRouter,
    ) -> ScriptExecutionResult {
        let mut reader = match command.execute_reader() {
            Ok(reader) => reader,
            Err(err) => return self.handle_db_error(err, router),
        };

        {
            let mut runtime = lock_or_recover(&self.control.runtime, "batch state");
            if runtime.state == BatchState::Cancelling {
                return ScriptExecutionResult::Cancel;
            }
            runtime.state = BatchState::ProcessingResults;
        }

        loop {
            if self.is_cancelling() {
                return ScriptExecutionResult::Cancel;
            }

            // Zero-column results only carried messages.
            if reader.field_count() > 0 {
                match self.process_result_set(reader.as_mut(), show_plan) {
                    Ok(ScriptExecutionResult::Success) => {}
                    Ok(other) => return other,
                    Err(err) => return self.handle_db_error(err, router),
                }
            }

            if self.is_cancelling() {
                return ScriptExecutionResult::Cancel;
            }

            match reader.next_result() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => return self.handle_db_error(err, router),
            }
        }

        self.rows_affected = reader.records_affected();
        drop(reader);
        self.completion_result(router)
    }

    fn process_result_set(
        &self,
        reader: &mut dyn ResultReader,
        show_plan: ShowPlanKind,
    ) -> Result<ScriptExecutionResult, DbError> {
        match &self.control.handler {
            Some(handler) => {
                let outcome = handler.on_result_set(reader, show_plan);
                handler.on_result_set_finished();
                outcome
            }
            None => {
                while reader.read()? {}
                Ok(ScriptExecutionResult::Success)
            }
        }
    }

    fn completion_result(&self, router: &MessageRouter) -> ScriptExecutionResult {
        if let Some(rows) = self.rows_affected {
            router.raise_message(&rows_affected_message(rows));
        }
        if self.has_errors() {
            ScriptExecutionResult::Failure
        } else {
            ScriptExecutionResult::Success
        }
    }

    fn handle_db_error(&self, err: DbError, router: &MessageRouter) -> ScriptExecutionResult {
        if self.is_cancelling() {
            tracing::debug!("ignoring error raised while cancelling: {err}");
            return ScriptExecutionResult::Cancel;
        }

        match err {
            DbError::Server(errors) => router.route(&errors),
            other => router.raise_error(&other.to_string()),
        }
        ScriptExecutionResult::Failure
    }
}
