use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_SEPARATOR: &str = "GO";

const BEGIN_TRAN: &str = "BEGIN TRAN";
const COMMIT_TRAN: &str = "COMMIT TRAN";
const ROLLBACK_TRAN: &str = "ROLLBACK";

/// Script-wide toggles applied around a run. Each run works on its own clone,
/// so changing a host's copy never affects a script already executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionEngineConditions {
    pub parse_only: bool,
    pub transaction_wrapped: bool,
    pub script_execution_tracked: bool,
    pub halt_on_error: bool,
    pub estimated_show_plan: bool,
    pub actual_show_plan: bool,
    pub suppress_provider_message_headers: bool,
    pub no_exec: bool,
    pub statistics_io: bool,
    pub show_plan_text: bool,
    pub statistics_time: bool,
    pub sqlcmd_mode: bool,
    pub batch_separator: String,
}

impl Default for ExecutionEngineConditions {
    fn default() -> Self {
        Self {
            parse_only: false,
            transaction_wrapped: false,
            script_execution_tracked: false,
            halt_on_error: false,
            estimated_show_plan: false,
            actual_show_plan: false,
            suppress_provider_message_headers: false,
            no_exec: false,
            statistics_io: false,
            show_plan_text: false,
            statistics_time: false,
            sqlcmd_mode: false,
            batch_separator: DEFAULT_BATCH_SEPARATOR.to_string(),
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

impl ExecutionEngineConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_only_statement(on: bool) -> String {
        format!("SET PARSEONLY {}", on_off(on))
    }

    pub fn no_exec_statement(on: bool) -> String {
        format!("SET NOEXEC {}", on_off(on))
    }

    pub fn statistics_io_statement(on: bool) -> String {
        format!("SET STATISTICS IO {}", on_off(on))
    }

    pub fn statistics_time_statement(on: bool) -> String {
        format!("SET STATISTICS TIME {}", on_off(on))
    }

    pub fn show_plan_xml_statement(on: bool) -> String {
        format!("SET SHOWPLAN_XML {}", on_off(on))
    }

    pub fn show_plan_all_statement(on: bool) -> String {
        format!("SET SHOWPLAN_ALL {}", on_off(on))
    }

    pub fn show_plan_text_statement(on: bool) -> String {
        format!("SET SHOWPLAN_TEXT {}", on_off(on))
    }

    pub fn statistics_xml_statement(on: bool) -> String {
        format!("SET STATISTICS XML {}", on_off(on))
    }

    pub fn statistics_profile_statement(on: bool) -> String {
        format!("SET STATISTICS PROFILE {}", on_off(on))
    }

    pub fn begin_trans_statement() -> &'static str {
        BEGIN_TRAN
    }

    pub fn commit_trans_statement() -> &'static str {
        COMMIT_TRAN
    }

    pub fn rollback_trans_statement() -> &'static str {
        ROLLBACK_TRAN
    }

    pub fn default_batch_separator() -> &'static str {
        DEFAULT_BATCH_SEPARATOR
    }

    /// True when `SET SHOWPLAN_TEXT` has to be issued. It cannot share a
    /// batch with other statements, and XML or actual plans take over when
    /// those are requested too.
    pub fn needs_show_plan_text(&self) -> bool {
        self.show_plan_text && !self.estimated_show_plan && !self.actual_show_plan
    }

    pub fn separator(&self) -> &str {
        let trimmed = self.batch_separator.trim();
        if trimmed.is_empty() {
            DEFAULT_BATCH_SEPARATOR
        } else {
            trimmed
        }
    }
}
