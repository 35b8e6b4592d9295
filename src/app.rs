use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::Local;

use sql_batch_engine::db::{
    post_condition_statements, pre_condition_statements, ExecutionEngine, ScriptExecutionResult,
    ScriptMessageKind,
};
use sql_batch_engine::utils::AppConfig;

pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new() -> Self {
        let config = AppConfig::load();
        Self { config }
    }

    pub fn parse(
        &mut self,
        file: &Path,
        separator: Option<String>,
        sqlcmd: bool,
        variables: Vec<(String, String)>,
    ) -> anyhow::Result<()> {
        let script = fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;

        let mut conditions = self.config.conditions.clone();
        if let Some(separator) = separator {
            conditions.batch_separator = separator;
        }
        conditions.sqlcmd_mode |= sqlcmd;

        let parsed =
            ExecutionEngine::parse_batches(&script, &conditions, self.config.starting_line)
                .with_context(|| format!("failed to parse {}", file.display()))?;

        println!(
            "-- {} parsed at {} {}",
            file.display(),
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            if conditions.sqlcmd_mode {
                "in SQLCMD mode"
            } else {
                "in plain mode"
            }
        );
        // Local parsing leaves references unresolved; list what a run would use.
        let overrides = variables.iter().map(|(name, value)| (name, value));
        for (name, value) in self.config.variables.iter().chain(overrides) {
            println!("-- :setvar {} \"{}\"", name, value);
        }

        for (message, kind, span) in &parsed.messages {
            let label = match kind {
                ScriptMessageKind::Warning => "warning",
                ScriptMessageKind::Error => "error",
                ScriptMessageKind::FatalError => "fatal",
            };
            println!("-- {} {}: {}", label, span, message);
        }

        for (index, batch) in parsed.batches.iter().enumerate() {
            println!(
                "-- batch {} lines {}-{} x{}{}",
                index + 1,
                batch.span.start_line,
                batch.span.end_line,
                batch.execution_count,
                batch
                    .sqlcmd_command
                    .map(|command| format!(" after {:?}", command))
                    .unwrap_or_default()
            );
            println!("{}", batch.text);
        }

        self.config.add_recent_script(file);
        if let Err(err) = self.config.save() {
            tracing::warn!("could not record {} as a recent script: {err}", file.display());
        }
        Ok(())
    }

    pub fn print_config(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.config)?;
        println!("{json}");
        Ok(())
    }

    pub fn print_statements(&self, server_version: u32, failed: bool) -> anyhow::Result<()> {
        let result = if failed {
            ScriptExecutionResult::Failure
        } else {
            ScriptExecutionResult::Success
        };

        println!("-- before");
        for statement in pre_condition_statements(&self.config.conditions, server_version) {
            println!("{statement}");
        }
        println!("-- after");
        for statement in post_condition_statements(&self.config.conditions, server_version, result)
        {
            println!("{statement}");
        }
        Ok(())
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
