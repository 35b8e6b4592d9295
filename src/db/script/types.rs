use std::fmt;

/// Position of a piece of script text. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextSpan {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

impl TextSpan {
    pub fn new(start_line: usize, start_column: usize, end_line: usize, end_column: usize) -> Self {
        Self {
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    pub fn line(line: usize) -> Self {
        Self::new(line, 1, line, 1)
    }

    /// The same span moved down by `lines`.
    pub fn shifted(self, lines: usize) -> Self {
        Self::new(
            self.start_line + lines,
            self.start_column,
            self.end_line + lines,
            self.end_column,
        )
    }
}

impl fmt::Display for TextSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{})-({},{})",
            self.start_line, self.start_column, self.end_line, self.end_column
        )
    }
}

/// SQLCMD directive that immediately preceded a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCmdCommand {
    Connect,
    OnError,
}

/// One batch found by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDefinition {
    pub text: String,
    pub span: TextSpan,
    pub execution_count: u32,
    pub sqlcmd_command: Option<SqlCmdCommand>,
}

impl BatchDefinition {
    /// Non-positive repeat counts run once.
    pub fn new(
        text: &str,
        span: TextSpan,
        execution_count: i32,
        sqlcmd_command: Option<SqlCmdCommand>,
    ) -> Self {
        let execution_count = u32::try_from(execution_count).unwrap_or(0).max(1);
        Self {
            text: text.to_string(),
            span,
            execution_count,
            sqlcmd_command,
        }
    }
}

/// Outcome of a batch or of a whole script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptExecutionResult {
    Success,
    Failure,
    Cancel,
    /// Stopped because of the halt-on-error policy or a lost connection.
    /// Reported externally as `Failure`.
    Halted,
}

impl ScriptExecutionResult {
    fn precedence(self) -> u8 {
        match self {
            ScriptExecutionResult::Success => 0,
            ScriptExecutionResult::Failure => 1,
            ScriptExecutionResult::Halted => 2,
            ScriptExecutionResult::Cancel => 3,
        }
    }

    /// Combine two outcomes. Once a non-success is recorded it sticks, and
    /// `Cancel`/`Halted` win over a plain `Failure`.
    pub fn merge(self, other: Self) -> Self {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }

    /// The externally visible form of the result.
    pub fn external(self) -> Self {
        match self {
            ScriptExecutionResult::Halted => ScriptExecutionResult::Failure,
            other => other,
        }
    }

    pub fn is_success(self) -> bool {
        self == ScriptExecutionResult::Success
    }
}

impl fmt::Display for ScriptExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScriptExecutionResult::Success => "Success",
            ScriptExecutionResult::Failure => "Failure",
            ScriptExecutionResult::Cancel => "Cancel",
            ScriptExecutionResult::Halted => "Halted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Initial,
    Executing,
    ProcessingResults,
    Executed,
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Initial,
    Executing,
    ExecutingBatch,
    Cancelling,
    Discarded,
}

/// Plan output the consumer should expect from a batch's result sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShowPlanKind {
    #[default]
    None,
    EstimatedXml,
    ActualXml,
    /// `SET SHOWPLAN_ALL` on pre-2005 servers.
    EstimatedLegacy,
    /// `SET STATISTICS PROFILE` on pre-2005 servers.
    ActualLegacy,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Ignore,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserAction {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMessageKind {
    Warning,
    Error,
    FatalError,
}
