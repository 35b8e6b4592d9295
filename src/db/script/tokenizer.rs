use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::parser::IncludeError;
use super::{ErrorAction, ParserAction, ScriptMessageKind, SqlCmdCommand, TextSpan};

const MAX_INCLUDE_DEPTH: usize = 32;

/// SQLCMD commands that are recognised but not acted upon.
static UNSUPPORTED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "out",
        "error",
        "listvar",
        "help",
        "serverlist",
        "xml",
        "perftrace",
        "ed",
        "!!",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, thiserror::Error)]
pub enum BatchParserError {
    /// A handler asked the tokenizer to stop. Whoever returned `Abort` has
    /// already reported why.
    #[error("Script parsing was aborted")]
    Aborted,

    #[error("{message}")]
    Syntax { message: String, span: TextSpan },

    #[error(transparent)]
    Include(#[from] IncludeError),
}

impl BatchParserError {
    pub fn span(&self) -> Option<TextSpan> {
        match self {
            BatchParserError::Syntax { span, .. } => Some(*span),
            _ => None,
        }
    }
}

/// Resolves `$(name)` references.
pub trait VariableResolver {
    fn get_variable(&mut self, span: TextSpan, name: &str) -> Option<String>;

    /// `None` removes the variable.
    fn set_variable(&mut self, span: TextSpan, name: &str, value: Option<&str>);
}

pub struct IncludedFile {
    pub name: String,
    pub content: String,
}

/// Callbacks the tokenizer drives, in document order.
pub trait CommandHandler: VariableResolver {
    fn go(
        &mut self,
        batch: &TextBlock,
        repeat_count: i32,
        command: Option<SqlCmdCommand>,
    ) -> ParserAction;

    fn include(
        &mut self,
        file_spec: &TextBlock,
    ) -> Result<(ParserAction, Option<IncludedFile>), IncludeError>;

    fn on_error(&mut self, token: &str, action: ErrorAction) -> ParserAction;

    fn connect(
        &mut self,
        timeout_secs: u32,
        server: &TextBlock,
        username: Option<&TextBlock>,
        password: Option<&TextBlock>,
    ) -> ParserAction;

    fn on_script_message(&mut self, message: &str, kind: ScriptMessageKind, span: TextSpan);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Variable { name: String, span: TextSpan },
}

/// Script text with its variable references kept apart, so substitution
/// can be applied or skipped by the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBlock {
    segments: Vec<Segment>,
    span: TextSpan,
}

impl TextBlock {
    pub fn from_text(text: &str, span: TextSpan) -> Self {
        let mut block = Self {
            segments: Vec::new(),
            span,
        };
        block.push_text(text);
        block
    }

    /// Split `text` on `$(name)` references. `line` and `first_column`
    /// place the text in the script.
    pub fn with_variables(text: &str, line: usize, first_column: usize) -> Self {
        let mut block = Self {
            segments: Vec::new(),
            span: TextSpan::new(
                line,
                first_column,
                line,
                first_column + text.chars().count(),
            ),
        };
        let chars: Vec<char> = text.chars().collect();
        let mut literal = String::new();
        let mut i = 0usize;
        while i < chars.len() {
            if let Some((name, end)) = variable_at(&chars, i) {
                block.push_text(&literal);
                literal.clear();
                let span = TextSpan::new(line, first_column + i, line, first_column + end + 1);
                block.push_variable(&name, span);
                i = end + 1;
                continue;
            }
            literal.push(chars[i]);
            i += 1;
        }
        block.push_text(&literal);
        block
    }

    pub fn span(&self) -> TextSpan {
        self.span
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_variables(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Variable { .. }))
    }

    /// The text exactly as written, references included.
    pub fn raw_text(&self) -> String {
        let mut text = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(value) => text.push_str(value),
                Segment::Variable { name, .. } => {
                    text.push_str("$(");
                    text.push_str(name);
                    text.push(')');
                }
            }
        }
        text
    }

    /// Substitute every reference. Unresolved references stay as written.
    pub fn resolve(&self, resolver: &mut dyn VariableResolver) -> String {
        let mut text = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(value) => text.push_str(value),
                Segment::Variable { name, span } => match resolver.get_variable(*span, name) {
                    Some(value) => text.push_str(&value),
                    None => {
                        text.push_str("$(");
                        text.push_str(name);
                        text.push(')');
                    }
                },
            }
        }
        text
    }

    fn is_blank(&self) -> bool {
        self.segments.iter().all(|segment| match segment {
            Segment::Text(value) => value.trim().is_empty(),
            Segment::Variable { .. } => false,
        })
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
            return;
        }
        self.segments.push(Segment::Text(text.to_string()));
    }

    fn push_variable(&mut self, name: &str, span: TextSpan) {
        self.segments.push(Segment::Variable {
            name: name.to_string(),
            span,
        });
    }

    fn trim_trailing_newline(&mut self) {
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            if last.ends_with('\n') {
                last.pop();
            }
            if last.is_empty() {
                self.segments.pop();
            }
        }
    }
}

fn is_variable_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '-'
}

/// `$(name)` starting at `start`: the name and the index of the closing paren.
fn variable_at(chars: &[char], start: usize) -> Option<(String, usize)> {
    if chars.get(start) != Some(&'$') || chars.get(start + 1) != Some(&'(') {
        return None;
    }
    let mut end = start + 2;
    while end < chars.len() && chars[end] != ')' {
        if !is_variable_name_char(chars[end]) {
            return None;
        }
        end += 1;
    }
    if end >= chars.len() || end == start + 2 {
        return None;
    }
    Some((chars[start + 2..end].iter().collect(), end))
}

#[derive(Default)]
struct ScanState {
    in_single_quote: bool,
    in_double_quote: bool,
    in_bracket: bool,
    block_comment_depth: usize,
}

impl ScanState {
    fn is_idle(&self) -> bool {
        !self.in_single_quote
            && !self.in_double_quote
            && !self.in_bracket
            && self.block_comment_depth == 0
    }

    /// Append one line to `block`, tracking quote and comment state so that
    /// separators inside strings or comments are never mistaken for real
    /// ones. Variable references are split out in SQLCMD mode, except inside
    /// comments.
    fn scan_line(&mut self, line: &str, line_no: usize, sqlcmd_mode: bool, block: &mut TextBlock) {
        let chars: Vec<char> = line.chars().collect();
        let len = chars.len();
        let mut literal = String::with_capacity(line.len());
        let mut i = 0usize;

        while i < len {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if self.block_comment_depth > 0 {
                literal.push(c);
                if c == '*' && next == Some('/') {
                    literal.push('/');
                    self.block_comment_depth -= 1;
                    i += 2;
                    continue;
                }
                if c == '/' && next == Some('*') {
                    literal.push('*');
                    self.block_comment_depth += 1;
                    i += 2;
                    continue;
                }
                i += 1;
                continue;
            }

            if sqlcmd_mode {
                if let Some((name, end)) = variable_at(&chars, i) {
                    block.push_text(&literal);
                    literal.clear();
                    block.push_variable(&name, TextSpan::new(line_no, i + 1, line_no, end + 2));
                    i = end + 1;
                    continue;
                }
            }

            if self.in_single_quote {
                literal.push(c);
                if c == '\'' {
                    if next == Some('\'') {
                        literal.push('\'');
                        i += 2;
                        continue;
                    }
                    self.in_single_quote = false;
                }
                i += 1;
                continue;
            }

            if self.in_double_quote {
                literal.push(c);
                if c == '"' {
                    if next == Some('"') {
                        literal.push('"');
                        i += 2;
                        continue;
                    }
                    self.in_double_quote = false;
                }
                i += 1;
                continue;
            }

            if self.in_bracket {
                literal.push(c);
                if c == ']' {
                    if next == Some(']') {
                        literal.push(']');
                        i += 2;
                        continue;
                    }
                    self.in_bracket = false;
                }
                i += 1;
                continue;
            }

            if c == '-' && next == Some('-') {
                literal.extend(&chars[i..]);
                break;
            }

            if c == '/' && next == Some('*') {
                literal.push_str("/*");
                self.block_comment_depth = 1;
                i += 2;
                continue;
            }

            match c {
                '\'' => self.in_single_quote = true,
                '"' => self.in_double_quote = true,
                '[' => self.in_bracket = true,
                _ => {}
            }
            literal.push(c);
            i += 1;
        }

        block.push_text(&literal);
    }
}

#[derive(Default)]
struct PendingBatch {
    block: TextBlock,
    start_line: Option<usize>,
    end: (usize, usize),
    command: Option<SqlCmdCommand>,
}

impl PendingBatch {
    fn append_line(&mut self, state: &mut ScanState, line: &str, line_no: usize, sqlcmd_mode: bool) {
        if self.start_line.is_none() {
            self.start_line = Some(line_no);
        }
        state.scan_line(line, line_no, sqlcmd_mode, &mut self.block);
        self.block.push_text("\n");
        self.end = (line_no, line.chars().count() + 1);
    }

    fn finish(mut self) -> (TextBlock, Option<SqlCmdCommand>) {
        let start_line = self.start_line.unwrap_or(self.end.0);
        self.block.trim_trailing_newline();
        self.block.span = TextSpan::new(start_line, 1, self.end.0, self.end.1);
        (self.block, self.command)
    }
}

struct Frame {
    lines: Vec<String>,
    next: usize,
    /// Script line of the `:r` directive that opened this frame. Every
    /// line of an included file is reported on it.
    included_at: Option<usize>,
}

impl Frame {
    fn new(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
            next: 0,
            included_at: None,
        }
    }

    fn included(text: &str, directive_line: usize) -> Self {
        Self {
            included_at: Some(directive_line),
            ..Self::new(text)
        }
    }

    /// The next line and the 1-based script line it is reported on.
    fn next_line(&mut self) -> Option<(usize, String)> {
        let line = self.lines.get(self.next)?.clone();
        self.next += 1;
        Some((self.included_at.unwrap_or(self.next), line))
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Splits a script into batches on separator lines and, in SQLCMD mode,
/// interprets `:` directives and `$(name)` references.
pub struct BatchTokenizer {
    separator: String,
    sqlcmd_mode: bool,
}

impl BatchTokenizer {
    pub fn new(separator: &str, sqlcmd_mode: bool) -> Self {
        let separator = separator.trim();
        let separator = if separator.is_empty() {
            super::DEFAULT_BATCH_SEPARATOR
        } else {
            separator
        };
        Self {
            separator: separator.to_string(),
            sqlcmd_mode,
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn parse(
        &self,
        script: &str,
        handler: &mut dyn CommandHandler,
    ) -> Result<(), BatchParserError> {
        let mut frames = vec![Frame::new(script)];
        let mut state = ScanState::default();
        let mut pending = PendingBatch::default();

        while let Some(frame) = frames.last_mut() {
            let Some((line_no, line)) = frame.next_line() else {
                frames.pop();
                continue;
            };

            if state.is_idle() {
                if let Some(count) = self.match_separator(&line, line_no)? {
                    Self::flush(&mut pending, count, handler)?;
                    continue;
                }

                if self.sqlcmd_mode {
                    if let Some((keyword, args)) = split_directive(&line) {
                        let flow = self.run_directive(
                            &keyword,
                            &args,
                            line_no,
                            &mut pending,
                            &mut state,
                            &mut frames,
                            handler,
                        )?;
                        match flow {
                            Flow::Continue => continue,
                            Flow::Stop => return Ok(()),
                        }
                    }
                }
            }

            pending.append_line(&mut state, &line, line_no, self.sqlcmd_mode);
        }

        Self::flush(&mut pending, 1, handler)
    }

    /// Repeat count when `line` is a separator line.
    fn match_separator(&self, line: &str, line_no: usize) -> Result<Option<i32>, BatchParserError> {
        let trimmed = line.trim();
        let Some(head) = trimmed.get(..self.separator.len()) else {
            return Ok(None);
        };
        if !head.eq_ignore_ascii_case(&self.separator) {
            return Ok(None);
        }

        let rest = &trimmed[self.separator.len()..];
        if !(rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with("--")) {
            return Ok(None);
        }

        let rest = match rest.find("--") {
            Some(pos) => &rest[..pos],
            None => rest,
        }
        .trim();
        if rest.is_empty() {
            return Ok(Some(1));
        }

        rest.parse::<i32>()
            .map(Some)
            .map_err(|_| BatchParserError::Syntax {
                message: format!(
                    "Incorrect syntax was encountered while parsing {}.",
                    self.separator
                ),
                span: TextSpan::new(line_no, 1, line_no, line.chars().count() + 1),
            })
    }

    fn flush(
        pending: &mut PendingBatch,
        repeat_count: i32,
        handler: &mut dyn CommandHandler,
    ) -> Result<(), BatchParserError> {
        let batch = std::mem::take(pending);
        if batch.block.is_blank() {
            return Ok(());
        }
        let (block, command) = batch.finish();
        match handler.go(&block, repeat_count, command) {
            ParserAction::Continue => Ok(()),
            ParserAction::Abort => Err(BatchParserError::Aborted),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_directive(
        &self,
        keyword: &str,
        args: &str,
        line_no: usize,
        pending: &mut PendingBatch,
        state: &mut ScanState,
        frames: &mut Vec<Frame>,
        handler: &mut dyn CommandHandler,
    ) -> Result<Flow, BatchParserError> {
        let span = TextSpan::new(line_no, 1, line_no, keyword.len() + args.len() + 2);

        match keyword {
            "setvar" => {
                match parse_setvar(args) {
                    Ok((name, value)) => {
                        handler.set_variable(span, &name, value.as_deref());
                    }
                    Err(message) => {
                        handler.on_script_message(&message, ScriptMessageKind::Error, span)
                    }
                }
                Ok(Flow::Continue)
            }
            "r" => {
                let file_spec = unquote(args.trim());
                if file_spec.is_empty() {
                    handler.on_script_message(
                        "Incorrect syntax: ':r' requires a file name.",
                        ScriptMessageKind::Error,
                        span,
                    );
                    return Ok(Flow::Continue);
                }
                let block = TextBlock::with_variables(&file_spec, line_no, 4);
                let (action, file) = handler.include(&block)?;
                if action == ParserAction::Abort {
                    return Err(BatchParserError::Aborted);
                }
                if let Some(file) = file {
                    if frames.len() > MAX_INCLUDE_DEPTH {
                        return Err(BatchParserError::Syntax {
                            message: format!(
                                "Included files are nested more than {} levels deep at '{}'.",
                                MAX_INCLUDE_DEPTH, file.name
                            ),
                            span,
                        });
                    }
                    tracing::debug!(file = %file.name, "including script file");
                    frames.push(Frame::included(&file.content, line_no));
                }
                Ok(Flow::Continue)
            }
            "connect" => {
                let Some(options) = parse_connect(args, line_no) else {
                    handler.on_script_message(
                        "Incorrect syntax: ':connect' requires a server name.",
                        ScriptMessageKind::Error,
                        span,
                    );
                    return Ok(Flow::Continue);
                };
                let action = handler.connect(
                    options.timeout_secs,
                    &options.server,
                    options.username.as_ref(),
                    options.password.as_ref(),
                );
                if action == ParserAction::Abort {
                    return Err(BatchParserError::Aborted);
                }
                pending.command = Some(SqlCmdCommand::Connect);
                Ok(Flow::Continue)
            }
            "on" => {
                let words: Vec<String> = args.split_whitespace().map(str::to_lowercase).collect();
                let action = match words.as_slice() {
                    [error, action] if error == "error" && action == "exit" => ErrorAction::Exit,
                    [error, action] if error == "error" && action == "ignore" => ErrorAction::Ignore,
                    _ => {
                        handler.on_script_message(
                            "Incorrect syntax: expected ':on error [exit|ignore]'.",
                            ScriptMessageKind::Error,
                            span,
                        );
                        return Ok(Flow::Continue);
                    }
                };
                if handler.on_error(args.trim(), action) == ParserAction::Abort {
                    return Err(BatchParserError::Aborted);
                }
                pending.command = Some(SqlCmdCommand::OnError);
                Ok(Flow::Continue)
            }
            "reset" => {
                *pending = PendingBatch::default();
                *state = ScanState::default();
                Ok(Flow::Continue)
            }
            "quit" => Ok(Flow::Stop),
            "exit" => {
                if args.trim_start().starts_with('(') {
                    Self::flush(pending, 1, handler)?;
                }
                Ok(Flow::Stop)
            }
            other if UNSUPPORTED_COMMANDS.contains(other) => {
                handler.on_script_message(
                    &format!("The SQLCMD command '{}' is not supported and was ignored.", other),
                    ScriptMessageKind::Warning,
                    span,
                );
                Ok(Flow::Continue)
            }
            other => {
                handler.on_script_message(
                    &format!("Unknown SQLCMD command ':{}'.", other),
                    ScriptMessageKind::Error,
                    span,
                );
                Ok(Flow::Continue)
            }
        }
    }
}

/// `:keyword args` (keyword lowercased) or `!! args`.
fn split_directive(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("!!") {
        return Some(("!!".to_string(), rest.to_string()));
    }
    let rest = trimmed.strip_prefix(':')?;
    let keyword_len = rest
        .find(|ch: char| !ch.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    if keyword_len == 0 {
        return None;
    }
    let (keyword, args) = rest.split_at(keyword_len);
    if !(args.is_empty() || args.starts_with(char::is_whitespace) || args.starts_with('(')) {
        return None;
    }
    Some((keyword.to_lowercase(), args.to_string()))
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map(|inner| inner.replace("\"\"", "\""))
        .unwrap_or_else(|| value.to_string())
}

fn parse_setvar(args: &str) -> Result<(String, Option<String>), String> {
    let args = args.trim();
    let (name, value) = match args.find(char::is_whitespace) {
        Some(pos) => (&args[..pos], args[pos..].trim()),
        None => (args, ""),
    };

    if name.is_empty() {
        return Err("Incorrect syntax: ':setvar' requires a variable name.".to_string());
    }
    if !name.chars().all(is_variable_name_char) {
        return Err(format!("Invalid scripting variable name '{}'.", name));
    }
    if value.is_empty() {
        return Ok((name.to_string(), None));
    }
    if value.starts_with('"') {
        if value.len() < 2 || !value.ends_with('"') {
            return Err(format!(
                "Incorrect syntax: unterminated value for scripting variable '{}'.",
                name
            ));
        }
        return Ok((name.to_string(), Some(unquote(value))));
    }
    Ok((name.to_string(), Some(value.to_string())))
}

struct ConnectOptions {
    server: TextBlock,
    username: Option<TextBlock>,
    password: Option<TextBlock>,
    timeout_secs: u32,
}

/// `:connect server [-l timeout] [-U user [-P password]]`
fn parse_connect(args: &str, line_no: usize) -> Option<ConnectOptions> {
    let mut tokens = args.split_whitespace();
    let server = tokens.next()?;
    let mut options = ConnectOptions {
        server: TextBlock::with_variables(&unquote(server), line_no, 10),
        username: None,
        password: None,
        timeout_secs: 0,
    };

    while let Some(token) = tokens.next() {
        match token {
            "-U" => {
                options.username = tokens
                    .next()
                    .map(|value| TextBlock::with_variables(&unquote(value), line_no, 1));
            }
            "-P" => {
                options.password = tokens
                    .next()
                    .map(|value| TextBlock::with_variables(&unquote(value), line_no, 1));
            }
            "-l" => {
                options.timeout_secs = tokens
                    .next()
                    .and_then(|value| value.parse::<u32>().ok())
                    .unwrap_or(0);
            }
            other => {
                tracing::debug!("ignoring :connect option '{other}'");
            }
        }
    }

    Some(options)
}
