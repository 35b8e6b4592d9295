use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{self, Path, PathBuf};

use crate::db::connection::ConnectionInfo;
use crate::db::session::VariableTable;

use super::tokenizer::{CommandHandler, IncludedFile, TextBlock, VariableResolver};
use super::{
    BatchDefinition, ErrorAction, ParserAction, ScriptMessageKind, SqlCmdCommand, TextSpan,
};

const MAX_PATH_LENGTH: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    #[error("The include file path '{0}' contains invalid characters.")]
    InvalidPathCharacters(String),

    #[error("The include file path '{0}' is too long.")]
    PathTooLong(String),

    #[error("Unable to include file '{path}': {source}")]
    Failed {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Where parsed batches and script-level notifications go.
pub trait BatchSink {
    /// Run one batch. Returning `false` stops the tokenizer.
    fn execute_batch(&mut self, batch: BatchDefinition) -> bool;

    fn error_action_changed(&mut self, _action: ErrorAction) {}

    /// `:connect`. Returning `false` stops the tokenizer.
    fn connect(&mut self, _info: ConnectionInfo) -> bool {
        false
    }

    fn script_message(&mut self, message: &str, kind: ScriptMessageKind, span: TextSpan);
}

/// Command handler and variable resolver for SQLCMD-style scripts.
pub struct BatchParser<'s> {
    sink: &'s mut dyn BatchSink,
    variables: VariableTable,
    variable_substitution_disabled: bool,
    starting_line: usize,
    halt_requested: bool,
}

impl<'s> BatchParser<'s> {
    pub fn new(sink: &'s mut dyn BatchSink) -> Self {
        Self {
            sink,
            variables: VariableTable::new(),
            variable_substitution_disabled: false,
            starting_line: 0,
            halt_requested: false,
        }
    }

    /// Keep `$(name)` references as written and never consult the variable
    /// table. Used when only batch boundaries are wanted.
    pub fn disable_variable_substitution(&mut self) {
        self.variable_substitution_disabled = true;
    }

    pub fn is_variable_substitution_disabled(&self) -> bool {
        self.variable_substitution_disabled
    }

    /// Offset added to every reported line number.
    pub fn set_starting_line(&mut self, line: usize) {
        self.starting_line = line;
    }

    pub fn merge_variables(&mut self, variables: &HashMap<String, String>) {
        self.variables.merge(variables);
    }

    pub fn variables(&self) -> &VariableTable {
        &self.variables
    }

    /// Set once an undefined variable was referenced.
    pub fn halt_requested(&self) -> bool {
        self.halt_requested
    }

    fn shift(&self, span: TextSpan) -> TextSpan {
        span.shifted(self.starting_line)
    }

    fn text_of(&mut self, block: &TextBlock) -> String {
        if self.variable_substitution_disabled {
            block.raw_text()
        } else {
            block.resolve(self)
        }
    }
}

impl VariableResolver for BatchParser<'_> {
    fn get_variable(&mut self, span: TextSpan, name: &str) -> Option<String> {
        if self.variable_substitution_disabled {
            return None;
        }

        match self.variables.resolve(name) {
            Some(value) => Some(value),
            None => {
                let span = self.shift(span);
                self.sink.script_message(
                    &format!("'{}' scripting variable not defined.", name),
                    ScriptMessageKind::FatalError,
                    span,
                );
                self.halt_requested = true;
                None
            }
        }
    }

    fn set_variable(&mut self, _span: TextSpan, name: &str, value: Option<&str>) {
        if self.variable_substitution_disabled {
            return;
        }
        self.variables.set(name, value);
    }
}

impl CommandHandler for BatchParser<'_> {
    fn go(
        &mut self,
        batch: &TextBlock,
        repeat_count: i32,
        command: Option<SqlCmdCommand>,
    ) -> ParserAction {
        let text = self.text_of(batch);
        if self.halt_requested {
            return ParserAction::Abort;
        }

        let definition = BatchDefinition::new(&text, self.shift(batch.span()), repeat_count, command);
        if self.sink.execute_batch(definition) {
            ParserAction::Continue
        } else {
            ParserAction::Abort
        }
    }

    fn include(
        &mut self,
        file_spec: &TextBlock,
    ) -> Result<(ParserAction, Option<IncludedFile>), IncludeError> {
        let spec = self.text_of(file_spec);
        if self.halt_requested {
            return Ok((ParserAction::Abort, None));
        }

        let Some(path) = resolve_include_path(&spec)? else {
            let span = self.shift(file_spec.span());
            self.sink.script_message(
                &format!("The file '{}' could not be found.", spec.trim()),
                ScriptMessageKind::FatalError,
                span,
            );
            return Ok((ParserAction::Abort, None));
        };

        let content = fs::read_to_string(&path).map_err(|source| IncludeError::Failed {
            path: path.display().to_string(),
            source,
        })?;
        Ok((
            ParserAction::Continue,
            Some(IncludedFile {
                name: path.display().to_string(),
                content,
            }),
        ))
    }

    fn on_error(&mut self, token: &str, action: ErrorAction) -> ParserAction {
        tracing::debug!(token, ?action, "error action changed");
        self.sink.error_action_changed(action);
        ParserAction::Continue
    }

    fn connect(
        &mut self,
        timeout_secs: u32,
        server: &TextBlock,
        username: Option<&TextBlock>,
        password: Option<&TextBlock>,
    ) -> ParserAction {
        let mut info = ConnectionInfo::new(&self.text_of(server));
        info.username = username.map(|block| self.text_of(block));
        info.password = password.map(|block| self.text_of(block));
        info.timeout_secs = timeout_secs;
        if self.halt_requested {
            return ParserAction::Abort;
        }

        if self.sink.connect(info) {
            ParserAction::Continue
        } else {
            ParserAction::Abort
        }
    }

    fn on_script_message(&mut self, message: &str, kind: ScriptMessageKind, span: TextSpan) {
        let span = self.shift(span);
        self.sink.script_message(message, kind, span);
    }
}

fn has_invalid_path_characters(spec: &str) -> bool {
    let reserved: &[char] = if cfg!(windows) {
        &['<', '>', '|', '"', '?', '*']
    } else {
        &[]
    };
    spec.chars()
        .any(|ch| ch == '\0' || ch.is_control() || reserved.contains(&ch))
}

/// Find an include file: as written, then relative to the working
/// directory, then as an absolute path. `Ok(None)` when no candidate exists.
pub fn resolve_include_path(spec: &str) -> Result<Option<PathBuf>, IncludeError> {
    let spec = spec.trim();
    let spec = spec
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(spec);

    if has_invalid_path_characters(spec) {
        return Err(IncludeError::InvalidPathCharacters(spec.to_string()));
    }
    if spec.len() > MAX_PATH_LENGTH {
        return Err(IncludeError::PathTooLong(spec.to_string()));
    }

    let direct = Path::new(spec);
    if direct.is_file() {
        return Ok(Some(direct.to_path_buf()));
    }

    let failed = |source: io::Error| IncludeError::Failed {
        path: spec.to_string(),
        source,
    };

    let relative = env::current_dir().map_err(failed)?.join(spec);
    if relative.is_file() {
        return Ok(Some(relative));
    }

    let absolute = path::absolute(spec).map_err(failed)?;
    if absolute.is_file() {
        return Ok(Some(absolute));
    }

    Ok(None)
}
