use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use super::*;
use crate::db::connection::ConnectionInfo;

#[derive(Default)]
struct Collector {
    batches: Vec<BatchDefinition>,
    messages: Vec<(String, ScriptMessageKind, TextSpan)>,
    error_actions: Vec<ErrorAction>,
    connections: Vec<ConnectionInfo>,
    reject_batches: bool,
}

impl BatchSink for Collector {
    fn execute_batch(&mut self, batch: BatchDefinition) -> bool {
        self.batches.push(batch);
        !self.reject_batches
    }

    fn error_action_changed(&mut self, action: ErrorAction) {
        self.error_actions.push(action);
    }

    fn connect(&mut self, info: ConnectionInfo) -> bool {
        self.connections.push(info);
        true
    }

    fn script_message(&mut self, message: &str, kind: ScriptMessageKind, span: TextSpan) {
        self.messages.push((message.to_string(), kind, span));
    }
}

fn run_sqlcmd(
    script: &str,
    collector: &mut Collector,
    configure: impl FnOnce(&mut BatchParser<'_>),
) -> Result<(), BatchParserError> {
    let mut parser = BatchParser::new(collector);
    configure(&mut parser);
    BatchTokenizer::new("GO", true).parse(script, &mut parser)
}

fn texts(collector: &Collector) -> Vec<&str> {
    collector
        .batches
        .iter()
        .map(|batch| batch.text.as_str())
        .collect()
}

fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sql_batch_engine_{}_{}",
        test,
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_go_builds_batch_definitions() {
    let mut collector = Collector::default();
    run_sqlcmd("SELECT 1\nGO 0\nSELECT 2\nGO 4", &mut collector, |_| {}).unwrap();

    assert_eq!(texts(&collector), vec!["SELECT 1", "SELECT 2"]);
    assert_eq!(collector.batches[0].execution_count, 1);
    assert_eq!(collector.batches[1].execution_count, 4);
    assert_eq!(collector.batches[1].span.start_line, 3);
}

#[test]
fn test_starting_line_offsets_spans() {
    let mut collector = Collector::default();
    run_sqlcmd("SELECT 1\nGO\nSELECT 2", &mut collector, |parser| {
        parser.set_starting_line(10)
    })
    .unwrap();

    assert_eq!(collector.batches[0].span.start_line, 11);
    assert_eq!(collector.batches[1].span.start_line, 13);
}

#[test]
fn test_host_variables_are_case_insensitive() {
    let mut variables = HashMap::new();
    variables.insert("DatabaseName".to_string(), "Sales".to_string());

    let mut collector = Collector::default();
    run_sqlcmd("USE $(DATABASENAME)", &mut collector, |parser| {
        parser.merge_variables(&variables)
    })
    .unwrap();

    assert_eq!(texts(&collector), vec!["USE Sales"]);
}

#[test]
fn test_environment_variable_fallback() {
    std::env::set_var("SQL_BATCH_ENGINE_TEST_FALLBACK", "from-env");

    let mut collector = Collector::default();
    run_sqlcmd("SELECT '$(sql_batch_engine_test_fallback)'", &mut collector, |_| {}).unwrap();

    assert_eq!(texts(&collector), vec!["SELECT 'from-env'"]);
}

#[test]
fn test_setvar_shadows_environment_variable() {
    std::env::set_var("SQL_BATCH_ENGINE_TEST_SHADOWED", "from-env");

    let mut collector = Collector::default();
    run_sqlcmd(
        ":setvar sql_batch_engine_test_shadowed mine\nSELECT '$(SQL_BATCH_ENGINE_TEST_SHADOWED)'",
        &mut collector,
        |_| {},
    )
    .unwrap();

    assert_eq!(texts(&collector), vec!["SELECT 'mine'"]);
}

#[test]
fn test_setvar_without_value_removes_variable() {
    let mut collector = Collector::default();
    let mut parser = BatchParser::new(&mut collector);
    BatchTokenizer::new("GO", true)
        .parse(":setvar Gone 1\n:setvar Kept 2\n:setvar gone", &mut parser)
        .unwrap();

    assert_eq!(parser.variables().get("GONE"), None);
    assert_eq!(parser.variables().get("kept"), Some("2"));
}

#[test]
fn test_undefined_variable_is_fatal_and_halts() {
    let mut collector = Collector::default();
    let mut parser = BatchParser::new(&mut collector);
    let err = BatchTokenizer::new("GO", true)
        .parse("SELECT 1\nGO\nSELECT $(Missing)\nGO\nSELECT 3", &mut parser)
        .unwrap_err();
    assert!(matches!(err, BatchParserError::Aborted));
    assert!(parser.halt_requested());

    assert_eq!(texts(&collector), vec!["SELECT 1"]);
    assert_eq!(collector.messages.len(), 1);
    let (message, kind, span) = &collector.messages[0];
    assert_eq!(message, "'Missing' scripting variable not defined.");
    assert_eq!(*kind, ScriptMessageKind::FatalError);
    assert_eq!(span.start_line, 3);
}

#[test]
fn test_disabled_substitution_keeps_references_and_ignores_setvar() {
    std::env::set_var("SQL_BATCH_ENGINE_TEST_DISABLED", "from-env");
    let mut variables = HashMap::new();
    variables.insert("Host".to_string(), "value".to_string());

    let mut collector = Collector::default();
    let mut parser = BatchParser::new(&mut collector);
    parser.merge_variables(&variables);
    parser.disable_variable_substitution();
    assert!(parser.is_variable_substitution_disabled());

    let span = TextSpan::line(1);
    assert_eq!(parser.get_variable(span, "Host"), None);
    assert_eq!(parser.get_variable(span, "SQL_BATCH_ENGINE_TEST_DISABLED"), None);
    parser.set_variable(span, "Added", Some("x"));
    assert_eq!(parser.variables().get("Added"), None);

    BatchTokenizer::new("GO", true)
        .parse(
            ":setvar Other 1\nSELECT '$(Host)', '$(Undefined)'",
            &mut parser,
        )
        .unwrap();
    assert!(!parser.halt_requested());
    assert_eq!(parser.variables().len(), 1);

    assert_eq!(texts(&collector), vec!["SELECT '$(Host)', '$(Undefined)'"]);
    assert!(collector.messages.is_empty());
}

#[test]
fn test_sink_rejection_aborts() {
    let mut collector = Collector {
        reject_batches: true,
        ..Collector::default()
    };
    let err = run_sqlcmd("SELECT 1\nGO\nSELECT 2", &mut collector, |_| {}).unwrap_err();
    assert!(matches!(err, BatchParserError::Aborted));
    assert_eq!(collector.batches.len(), 1);
}

#[test]
fn test_on_error_is_forwarded() {
    let mut collector = Collector::default();
    run_sqlcmd(":on error exit\nSELECT 1", &mut collector, |_| {}).unwrap();
    assert_eq!(collector.error_actions, vec![ErrorAction::Exit]);
    assert_eq!(collector.batches[0].sqlcmd_command, Some(SqlCmdCommand::OnError));
}

#[test]
fn test_connect_builds_connection_info() {
    let mut collector = Collector::default();
    run_sqlcmd(
        ":setvar Target reporting01\n:connect $(Target) -U report -P pw -l 5\nSELECT 1",
        &mut collector,
        |_| {},
    )
    .unwrap();

    assert_eq!(collector.connections.len(), 1);
    let info = &collector.connections[0];
    assert_eq!(info.server, "reporting01");
    assert_eq!(info.username.as_deref(), Some("report"));
    assert_eq!(info.password.as_deref(), Some("pw"));
    assert_eq!(info.timeout_secs, 5);
    assert!(!format!("{info:?}").contains("pw"));
}

#[test]
fn test_include_reads_file() {
    let dir = scratch_dir("include");
    let path = dir.join("part.sql");
    fs::write(&path, "SELECT 'included'\nGO\n").unwrap();

    let mut collector = Collector::default();
    let script = format!("SELECT 1\nGO\n:r \"{}\"\nSELECT 2", path.display());
    run_sqlcmd(&script, &mut collector, |_| {}).unwrap();

    assert_eq!(
        texts(&collector),
        vec!["SELECT 1", "SELECT 'included'", "SELECT 2"]
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_include_path_uses_variables() {
    let dir = scratch_dir("include_var");
    fs::write(dir.join("vars.sql"), "SELECT 'via variable'").unwrap();
    let mut variables = HashMap::new();
    variables.insert("ScriptDir".to_string(), dir.display().to_string());

    let mut collector = Collector::default();
    run_sqlcmd(":r $(ScriptDir)/vars.sql", &mut collector, |parser| {
        parser.merge_variables(&variables)
    })
    .unwrap();

    assert_eq!(texts(&collector), vec!["SELECT 'via variable'"]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_missing_include_file_is_fatal() {
    let mut collector = Collector::default();
    let err = run_sqlcmd(
        "SELECT 1\nGO\n:r no_such_dir_for_tests/missing.sql\nSELECT 2",
        &mut collector,
        |_| {},
    )
    .unwrap_err();

    assert!(matches!(err, BatchParserError::Aborted));
    assert_eq!(texts(&collector), vec!["SELECT 1"]);
    assert_eq!(collector.messages[0].1, ScriptMessageKind::FatalError);
    assert!(collector.messages[0].0.contains("missing.sql"));
}

#[test]
fn test_include_path_with_control_characters_is_rejected() {
    let err = resolve_include_path("bad\u{1}name.sql").unwrap_err();
    assert!(matches!(err, IncludeError::InvalidPathCharacters(_)));
}

#[test]
fn test_overlong_include_path_is_rejected() {
    let err = resolve_include_path(&"a".repeat(5000)).unwrap_err();
    assert!(matches!(err, IncludeError::PathTooLong(_)));
}

#[test]
fn test_include_error_surfaces_through_tokenizer() {
    let mut collector = Collector::default();
    let err = run_sqlcmd(":r bad\u{1}name.sql", &mut collector, |_| {}).unwrap_err();
    assert!(matches!(
        err,
        BatchParserError::Include(IncludeError::InvalidPathCharacters(_))
    ));
}

#[test]
fn test_missing_include_path_resolves_to_none() {
    assert!(resolve_include_path("no_such_dir_for_tests/missing.sql")
        .unwrap()
        .is_none());
}
