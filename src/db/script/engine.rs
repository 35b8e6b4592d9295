use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;

use crate::db::connection::{
    lock_or_recover, ConnectionFactory, ConnectionInfo, DbConnection, DbError, ResultReader,
    ServerError,
};

use super::executor::{Batch, BatchCancelHandle, BatchEventHandler};
use super::parser::{BatchParser, BatchSink};
use super::tokenizer::{BatchParserError, BatchTokenizer};
use super::{
    BatchDefinition, ErrorAction, ExecutionEngineConditions, ExecutionState,
    ScriptExecutionResult, ScriptMessageKind, ShowPlanKind, SqlCmdCommand, TextSpan,
};

/// Server major version that introduced XML show plans.
const XML_SHOW_PLAN_MIN_VERSION: u32 = 9;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("A script is already executing on this engine")]
    AlreadyExecuting,

    #[error("The engine was discarded after a cancel request and cannot run scripts")]
    Discarded,
}

/// Script-level notifications. Batch-level output goes through
/// [`BatchEventHandler`].
pub trait ScriptEventHandler: Send + Sync {
    fn on_batch_started(&self, _batch: &Batch) {}

    fn on_batch_finished(
        &self,
        _batch: &Batch,
        _result: ScriptExecutionResult,
        _command: Option<SqlCmdCommand>,
    ) {
    }

    fn on_script_parse_error(&self, _message: &str, _kind: ScriptMessageKind, _span: TextSpan) {}

    fn on_script_finished(&self, _result: ScriptExecutionResult, _elapsed: chrono::Duration) {}
}

/// Everything one `run_script` call needs.
pub struct ScriptExecutionArgs {
    pub script: String,
    pub connection: Arc<dyn DbConnection>,
    pub conditions: ExecutionEngineConditions,
    /// Per-batch timeout in seconds, 0 for none.
    pub execution_timeout: u32,
    /// Merged into the SQLCMD variable table before the run.
    pub variables: HashMap<String, String>,
    /// Added to reported line numbers.
    pub starting_line: usize,
}

impl ScriptExecutionArgs {
    pub fn new(script: &str, connection: Arc<dyn DbConnection>) -> Self {
        Self {
            script: script.to_string(),
            connection,
            conditions: ExecutionEngineConditions::default(),
            execution_timeout: 0,
            variables: HashMap::new(),
            starting_line: 0,
        }
    }

    pub fn with_conditions(mut self, conditions: &ExecutionEngineConditions) -> Self {
        self.conditions = conditions.clone();
        self
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.execution_timeout = seconds;
        self
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_starting_line(mut self, line: usize) -> Self {
        self.starting_line = line;
        self
    }
}

/// Batches and script messages found by [`ExecutionEngine::parse_batches`].
#[derive(Debug, Default)]
pub struct ParsedScript {
    pub batches: Vec<BatchDefinition>,
    pub messages: Vec<(String, ScriptMessageKind, TextSpan)>,
}

impl BatchSink for ParsedScript {
    fn execute_batch(&mut self, batch: BatchDefinition) -> bool {
        self.batches.push(batch);
        true
    }

    fn connect(&mut self, _info: ConnectionInfo) -> bool {
        true
    }

    fn script_message(&mut self, message: &str, kind: ScriptMessageKind, span: TextSpan) {
        self.messages.push((message.to_string(), kind, span));
    }
}

/// Forwards batch events to the host until detached.
struct DetachableBatchEvents {
    handler: Option<Arc<dyn BatchEventHandler>>,
    attached: AtomicBool,
}

impl DetachableBatchEvents {
    fn target(&self) -> Option<&Arc<dyn BatchEventHandler>> {
        if self.attached.load(Ordering::SeqCst) {
            self.handler.as_ref()
        } else {
            None
        }
    }

    fn attach(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}

impl BatchEventHandler for DetachableBatchEvents {
    fn on_batch_error(&self, message: &str, error: Option<&ServerError>, span: TextSpan) {
        if let Some(handler) = self.target() {
            handler.on_batch_error(message, error, span);
        }
    }

    fn on_batch_message(&self, detailed: Option<&str>, message: &str, error: Option<&ServerError>) {
        if let Some(handler) = self.target() {
            handler.on_batch_message(detailed, message, error);
        }
    }

    fn on_result_set(
        &self,
        reader: &mut dyn ResultReader,
        show_plan: ShowPlanKind,
    ) -> Result<ScriptExecutionResult, DbError> {
        match self.target() {
            Some(handler) => handler.on_result_set(reader, show_plan),
            None if self.handler.is_some() => Ok(ScriptExecutionResult::Cancel),
            None => {
                while reader.read()? {}
                Ok(ScriptExecutionResult::Success)
            }
        }
    }

    fn on_result_set_finished(&self) {
        if let Some(handler) = self.target() {
            handler.on_result_set_finished();
        }
    }

    fn on_cancelling(&self) {
        if let Some(handler) = self.target() {
            handler.on_cancelling();
        }
    }
}

struct EngineControl {
    state: ExecutionState,
    current_batch: Option<BatchCancelHandle>,
}

/// Runs scripts batch by batch against a connection.
///
/// `run_script` blocks the calling thread. `cancel_current_batch` and
/// `discard` are meant to be called from another thread while it runs.
pub struct ExecutionEngine {
    control: Mutex<EngineControl>,
    batch_events: Arc<DetachableBatchEvents>,
    script_events: Option<Arc<dyn ScriptEventHandler>>,
    connection_factory: Option<Arc<dyn ConnectionFactory>>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(EngineControl {
                state: ExecutionState::Initial,
                current_batch: None,
            }),
            batch_events: Arc::new(DetachableBatchEvents {
                handler: None,
                attached: AtomicBool::new(false),
            }),
            script_events: None,
            connection_factory: None,
        }
    }

    pub fn with_batch_event_handler(mut self, handler: Arc<dyn BatchEventHandler>) -> Self {
        self.batch_events = Arc::new(DetachableBatchEvents {
            handler: Some(handler),
            attached: AtomicBool::new(false),
        });
        self
    }

    pub fn with_script_event_handler(mut self, handler: Arc<dyn ScriptEventHandler>) -> Self {
        self.script_events = Some(handler);
        self
    }

    /// Needed for the SQLCMD `:connect` directive.
    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn state(&self) -> ExecutionState {
        lock_or_recover(&self.control, "execution engine").state
    }

    pub fn is_discarded(&self) -> bool {
        self.state() == ExecutionState::Discarded
    }

    /// Split `script` into batches without executing anything. Variable
    /// references are left as written. `starting_line` is added to every
    /// batch and message span.
    pub fn parse_batches(
        script: &str,
        conditions: &ExecutionEngineConditions,
        starting_line: usize,
    ) -> Result<ParsedScript, BatchParserError> {
        let tokenizer = BatchTokenizer::new(conditions.separator(), conditions.sqlcmd_mode);
        let mut parsed = ParsedScript::default();
        {
            let mut parser = BatchParser::new(&mut parsed);
            parser.disable_variable_substitution();
            parser.set_starting_line(starting_line);
            tokenizer.parse(script, &mut parser)?;
        }
        Ok(parsed)
    }

    /// Execute a whole script. The returned result is never `Halted`.
    pub fn run_script(
        &self,
        args: ScriptExecutionArgs,
    ) -> Result<ScriptExecutionResult, EngineError> {
        {
            let mut control = lock_or_recover(&self.control, "execution engine");
            match control.state {
                ExecutionState::Initial => control.state = ExecutionState::Executing,
                ExecutionState::Discarded => return Err(EngineError::Discarded),
                _ => return Err(EngineError::AlreadyExecuting),
            }
        }

        let started = Local::now();
        self.batch_events.attach();
        tracing::debug!("script execution started");

        let mut run = ScriptRun::new(self, &args);
        let mut result = run.run_pre_conditions();
        if result.is_success() {
            result = run.parse_and_execute(&args.script, &args.variables, args.starting_line);
        }

        if self.is_discarded() {
            tracing::debug!("connection discarded; skipping post-condition batches");
        } else {
            let post = run.run_post_conditions(result);
            result = result.merge(post);
        }

        run.disconnect_sqlcmd_connection();
        drop(run);
        self.batch_events.detach();

        {
            let mut control = lock_or_recover(&self.control, "execution engine");
            control.current_batch = None;
            if control.state != ExecutionState::Discarded {
                control.state = ExecutionState::Initial;
            }
        }

        let result = result.external();
        tracing::debug!(%result, "script execution finished");
        if let Some(events) = &self.script_events {
            events.on_script_finished(result, Local::now() - started);
        }
        Ok(result)
    }

    /// Cancel the batch that is currently running, if any, and stop the
    /// script after it.
    pub fn cancel_current_batch(&self) {
        let batch = {
            let mut control = lock_or_recover(&self.control, "execution engine");
            match control.state {
                ExecutionState::Executing | ExecutionState::ExecutingBatch => {}
                _ => return,
            }
            control.state = ExecutionState::Cancelling;
            control.current_batch.clone()
        };

        tracing::debug!("script cancel requested");
        if let Some(batch) = batch {
            batch.cancel();
        }
    }

    /// Give up on a cancel that did not complete. Batch events stop flowing
    /// and the host should [`ExecutionEngine::close`] the connection.
    pub fn discard(&self) {
        {
            let mut control = lock_or_recover(&self.control, "execution engine");
            control.state = ExecutionState::Discarded;
            control.current_batch = None;
        }
        self.batch_events.detach();
        tracing::debug!("execution engine discarded");
    }

    /// Force the connection closed after [`ExecutionEngine::discard`].
    pub fn close(&self, connection: &dyn DbConnection) {
        if !self.is_discarded() {
            return;
        }
        if let Err(err) = connection.close() {
            tracing::warn!("failed to close discarded connection: {err}");
        }
    }

    /// Publish `batch` as the cancel target. `false` when it must not run.
    fn enter_batch(&self, batch: BatchCancelHandle, allow_when_cancelling: bool) -> bool {
        let mut control = lock_or_recover(&self.control, "execution engine");
        match control.state {
            ExecutionState::Discarded => return false,
            ExecutionState::Cancelling if !allow_when_cancelling => return false,
            ExecutionState::Cancelling => {}
            _ => control.state = ExecutionState::ExecutingBatch,
        }
        control.current_batch = Some(batch);
        true
    }

    fn leave_batch(&self) {
        let mut control = lock_or_recover(&self.control, "execution engine");
        control.current_batch = None;
        if control.state == ExecutionState::ExecutingBatch {
            control.state = ExecutionState::Executing;
        }
    }

    fn is_cancelling(&self) -> bool {
        self.state() == ExecutionState::Cancelling
    }
}

/// Plan output produced once the pre-condition batches ran.
pub fn expected_show_plan(
    conditions: &ExecutionEngineConditions,
    server_major_version: u32,
) -> ShowPlanKind {
    let xml = server_major_version >= XML_SHOW_PLAN_MIN_VERSION;
    if conditions.estimated_show_plan {
        if xml {
            ShowPlanKind::EstimatedXml
        } else {
            ShowPlanKind::EstimatedLegacy
        }
    } else if conditions.actual_show_plan {
        if xml {
            ShowPlanKind::ActualXml
        } else {
            ShowPlanKind::ActualLegacy
        }
    } else if conditions.show_plan_text {
        ShowPlanKind::Text
    } else {
        ShowPlanKind::None
    }
}

fn show_plan_statement(
    conditions: &ExecutionEngineConditions,
    server_major_version: u32,
    on: bool,
) -> Option<String> {
    let xml = server_major_version >= XML_SHOW_PLAN_MIN_VERSION;
    if conditions.estimated_show_plan {
        Some(if xml {
            ExecutionEngineConditions::show_plan_xml_statement(on)
        } else {
            ExecutionEngineConditions::show_plan_all_statement(on)
        })
    } else if conditions.actual_show_plan {
        Some(if xml {
            ExecutionEngineConditions::statistics_xml_statement(on)
        } else {
            ExecutionEngineConditions::statistics_profile_statement(on)
        })
    } else {
        None
    }
}

/// Statements issued before the script, one batch each, in order.
/// NOEXEC is switched on last so the other options still take effect.
pub fn pre_condition_statements(
    conditions: &ExecutionEngineConditions,
    server_major_version: u32,
) -> Vec<String> {
    let mut statements = Vec::new();
    if conditions.statistics_io {
        statements.push(ExecutionEngineConditions::statistics_io_statement(true));
    }
    if conditions.statistics_time {
        statements.push(ExecutionEngineConditions::statistics_time_statement(true));
    }
    if let Some(statement) = show_plan_statement(conditions, server_major_version, true) {
        statements.push(statement);
    }
    if conditions.transaction_wrapped {
        statements.push(ExecutionEngineConditions::begin_trans_statement().to_string());
    }
    if conditions.parse_only {
        statements.push(ExecutionEngineConditions::parse_only_statement(true));
    }
    if conditions.no_exec {
        statements.push(ExecutionEngineConditions::no_exec_statement(true));
    }
    // SHOWPLAN_TEXT must be alone in its batch.
    if conditions.needs_show_plan_text() {
        statements.insert(0, ExecutionEngineConditions::show_plan_text_statement(true));
    }
    statements
}

/// Statements issued after the script. The transaction is committed only
/// when the script succeeded.
pub fn post_condition_statements(
    conditions: &ExecutionEngineConditions,
    server_major_version: u32,
    script_result: ScriptExecutionResult,
) -> Vec<String> {
    let mut statements = Vec::new();
    if conditions.needs_show_plan_text() {
        statements.push(ExecutionEngineConditions::show_plan_text_statement(false));
    }
    if conditions.no_exec {
        statements.push(ExecutionEngineConditions::no_exec_statement(false));
    }
    if conditions.parse_only {
        statements.push(ExecutionEngineConditions::parse_only_statement(false));
    }
    if let Some(statement) = show_plan_statement(conditions, server_major_version, false) {
        statements.push(statement);
    }
    if conditions.statistics_io {
        statements.push(ExecutionEngineConditions::statistics_io_statement(false));
    }
    if conditions.statistics_time {
        statements.push(ExecutionEngineConditions::statistics_time_statement(false));
    }
    if conditions.transaction_wrapped {
        let statement = if script_result.is_success() {
            ExecutionEngineConditions::commit_trans_statement()
        } else {
            ExecutionEngineConditions::rollback_trans_statement()
        };
        statements.push(statement.to_string());
    }
    statements
}

/// State of one `run_script` call.
struct ScriptRun<'e> {
    engine: &'e ExecutionEngine,
    conditions: ExecutionEngineConditions,
    connection: Arc<dyn DbConnection>,
    /// The current connection was opened by `:connect` and is ours to close.
    owns_connection: bool,
    execution_timeout: u32,
    error_action: ErrorAction,
    show_plan: ShowPlanKind,
    batch: Batch,
    batch_index: usize,
    next_tracking_id: u32,
    result: ScriptExecutionResult,
}

impl<'e> ScriptRun<'e> {
    fn new(engine: &'e ExecutionEngine, args: &ScriptExecutionArgs) -> Self {
        let conditions = args.conditions.clone();
        let error_action = if conditions.halt_on_error {
            ErrorAction::Exit
        } else {
            ErrorAction::Ignore
        };
        let show_plan = expected_show_plan(&conditions, args.connection.server_major_version());
        let batch_events: Arc<dyn BatchEventHandler> = engine.batch_events.clone();
        let batch = Batch::new("", true, args.execution_timeout).with_event_handler(batch_events);

        Self {
            engine,
            conditions,
            connection: Arc::clone(&args.connection),
            owns_connection: false,
            execution_timeout: args.execution_timeout,
            error_action,
            show_plan,
            batch,
            batch_index: 0,
            next_tracking_id: 0,
            result: ScriptExecutionResult::Success,
        }
    }

    fn run_pre_conditions(&mut self) -> ScriptExecutionResult {
        let statements =
            pre_condition_statements(&self.conditions, self.connection.server_major_version());
        self.run_condition_batches(&statements)
    }

    fn run_post_conditions(&mut self, script_result: ScriptExecutionResult) -> ScriptExecutionResult {
        let statements = post_condition_statements(
            &self.conditions,
            self.connection.server_major_version(),
            script_result,
        );
        self.run_condition_batches(&statements)
    }

    /// Stops at the first batch that does not succeed.
    fn run_condition_batches(&mut self, statements: &[String]) -> ScriptExecutionResult {
        for statement in statements {
            let batch_events: Arc<dyn BatchEventHandler> = self.engine.batch_events.clone();
            let mut batch = Batch::new(statement, false, self.execution_timeout)
                .with_event_handler(batch_events);
            batch.set_suppress_provider_message_headers(
                self.conditions.suppress_provider_message_headers,
            );

            if !self.engine.enter_batch(batch.cancel_handle(), true) {
                return ScriptExecutionResult::Cancel;
            }
            tracing::debug!(statement = %statement, "running condition batch");
            let result = batch.execute(self.connection.as_ref(), ShowPlanKind::None);
            self.engine.leave_batch();

            if !result.is_success() {
                return result;
            }
        }
        ScriptExecutionResult::Success
    }

    fn parse_and_execute(
        &mut self,
        script: &str,
        variables: &HashMap<String, String>,
        starting_line: usize,
    ) -> ScriptExecutionResult {
        let tokenizer =
            BatchTokenizer::new(self.conditions.separator(), self.conditions.sqlcmd_mode);

        let parsed = {
            let mut parser = BatchParser::new(self);
            parser.merge_variables(variables);
            parser.set_starting_line(starting_line);
            tokenizer.parse(script, &mut parser)
        };

        match parsed {
            Ok(()) | Err(BatchParserError::Aborted) => {}
            Err(err) => {
                let span = err.span().unwrap_or_default().shifted(starting_line);
                self.report_script_message(
                    &format!("A fatal scripting error occurred.\n{}", err),
                    ScriptMessageKind::FatalError,
                    span,
                );
                self.result = self.result.merge(ScriptExecutionResult::Failure);
            }
        }

        if self.engine.is_cancelling() {
            self.result = self.result.merge(ScriptExecutionResult::Cancel);
        }
        self.result
    }

    fn execute_definition(&mut self, definition: &BatchDefinition) -> ScriptExecutionResult {
        self.batch.reset();
        self.batch.set_text(&definition.text);
        self.batch.set_span(definition.span);
        self.batch.set_index(self.batch_index);
        self.batch_index += 1;
        self.batch
            .set_expected_execution_count(definition.execution_count);
        self.batch
            .set_suppress_provider_message_headers(self.conditions.suppress_provider_message_headers);
        if self.conditions.script_execution_tracked {
            self.next_tracking_id += 1;
            self.batch.set_script_tracking_id(self.next_tracking_id);
        }

        if !self.engine.enter_batch(self.batch.cancel_handle(), false) {
            return ScriptExecutionResult::Cancel;
        }

        if let Some(events) = &self.engine.script_events {
            events.on_batch_started(&self.batch);
        }

        let expected = self.batch.expected_execution_count();
        if expected > 1 {
            self.engine
                .batch_events
                .on_batch_message(None, "Beginning execution loop", None);
        }

        let mut result = ScriptExecutionResult::Success;
        let mut completed = 0u32;
        for _ in 0..expected {
            let mut iteration = self.batch.execute(self.connection.as_ref(), self.show_plan);
            completed += 1;

            if !self.connection.is_open() {
                iteration = ScriptExecutionResult::Halted;
            } else if iteration == ScriptExecutionResult::Failure
                && self.error_action == ErrorAction::Exit
            {
                iteration = ScriptExecutionResult::Halted;
            }

            result = result.merge(iteration);
            if matches!(
                iteration,
                ScriptExecutionResult::Cancel | ScriptExecutionResult::Halted
            ) {
                break;
            }
        }

        self.engine.leave_batch();

        if expected > 1 {
            self.engine.batch_events.on_batch_message(
                None,
                &format!("Batch execution completed {} times...", completed),
                None,
            );
        }

        if let Some(events) = &self.engine.script_events {
            events.on_batch_finished(&self.batch, result, definition.sqlcmd_command);
        }
        result
    }

    fn report_script_message(&self, message: &str, kind: ScriptMessageKind, span: TextSpan) {
        if let Some(events) = &self.engine.script_events {
            events.on_script_parse_error(message, kind, span);
        }
    }

    fn disconnect_sqlcmd_connection(&mut self) {
        if !self.owns_connection {
            return;
        }
        if let Err(err) = self.connection.close() {
            tracing::warn!("failed to close SQLCMD connection: {err}");
        }
        self.owns_connection = false;
    }
}

impl BatchSink for ScriptRun<'_> {
    fn execute_batch(&mut self, batch: BatchDefinition) -> bool {
        let result = self.execute_definition(&batch);
        self.result = self.result.merge(result);
        !matches!(
            result,
            ScriptExecutionResult::Cancel | ScriptExecutionResult::Halted
        )
    }

    fn error_action_changed(&mut self, action: ErrorAction) {
        self.error_action = action;
    }

    fn connect(&mut self, info: ConnectionInfo) -> bool {
        let Some(factory) = self.engine.connection_factory.clone() else {
            self.report_script_message(
                "The SQLCMD ':connect' command is not available for this connection.",
                ScriptMessageKind::Error,
                TextSpan::default(),
            );
            self.result = self.result.merge(ScriptExecutionResult::Failure);
            return false;
        };

        self.disconnect_sqlcmd_connection();
        tracing::debug!(connection = %info.connection_string(), "SQLCMD reconnect");
        match factory.connect(&info) {
            Ok(connection) => {
                self.connection = connection;
                self.owns_connection = true;
                self.show_plan =
                    expected_show_plan(&self.conditions, self.connection.server_major_version());
                let pre = self.run_pre_conditions();
                self.result = self.result.merge(pre);
                pre.is_success()
            }
            Err(err) => {
                self.report_script_message(
                    &format!("Unable to connect to server '{}': {}", info.server, err),
                    ScriptMessageKind::Error,
                    TextSpan::default(),
                );
                self.result = self.result.merge(ScriptExecutionResult::Failure);
                false
            }
        }
    }

    fn script_message(&mut self, message: &str, kind: ScriptMessageKind, span: TextSpan) {
        if kind == ScriptMessageKind::FatalError {
            self.result = self.result.merge(ScriptExecutionResult::Failure);
        }
        self.report_script_message(message, kind, span);
    }
}
