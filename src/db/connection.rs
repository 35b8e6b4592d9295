use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// One error or informational message returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub number: i32,
    /// Severity class. Anything above 10 is an error.
    pub class: u8,
    pub state: u8,
    pub source: String,
    pub procedure: Option<String>,
    /// Line number relative to the start of the batch text, 0 when unknown.
    pub line_number: u32,
    pub message: String,
}

impl ServerError {
    pub fn new(number: i32, class: u8, state: u8, message: &str) -> Self {
        Self {
            number,
            class,
            state,
            source: String::new(),
            procedure: None,
            line_number: 0,
            message: message.to_string(),
        }
    }

    pub fn with_line(mut self, line_number: u32) -> Self {
        self.line_number = line_number;
        self
    }

    pub fn with_procedure(mut self, procedure: &str) -> Self {
        self.procedure = Some(procedure.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.class > 10
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg {}, Level {}: {}", self.number, self.class, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The server answered with one or more errors. Warnings that arrived in
    /// the same response travel along with them.
    #[error("{}", format_server_errors(.0))]
    Server(Vec<ServerError>),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Execution timeout expired")]
    Timeout,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_server_errors(errors: &[ServerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Receives informational messages (PRINT output, warnings, errors raised
/// while a statement still completes) as the driver reads them off the wire.
/// Drivers must invoke it synchronously on the thread that is executing the
/// command.
pub type InfoMessageHandler = Arc<dyn Fn(&[ServerError]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// Sequential reader over the result sets produced by one command.
pub trait ResultReader {
    /// Number of columns in the current result set. Zero means the current
    /// "result" only carried messages.
    fn field_count(&self) -> usize;

    fn columns(&self) -> Vec<ColumnInfo>;

    /// Advance to the next row of the current result set.
    fn read(&mut self) -> Result<bool, DbError>;

    /// Value of column `index` in the current row, `None` for NULL.
    fn get_string(&self, index: usize) -> Option<String>;

    /// Advance to the next result set.
    fn next_result(&mut self) -> Result<bool, DbError>;

    /// Total rows affected by the command, once every result set has been
    /// consumed. `None` when the server did not report a count.
    fn records_affected(&self) -> Option<u64>;
}

/// A command created from batch text. Every method takes `&self` so that a
/// second thread can call [`DbCommand::cancel`] while the executing thread is
/// blocked inside `execute_*`.
pub trait DbCommand: Send + Sync {
    fn execute_non_query(&self) -> Result<Option<u64>, DbError>;

    fn execute_reader(&self) -> Result<Box<dyn ResultReader + '_>, DbError>;

    fn cancel(&self) -> Result<(), DbError>;
}

pub trait DbConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Major version of the server, e.g. 8 for SQL Server 2000, 9 for 2005.
    fn server_major_version(&self) -> u32;

    /// Create a command. `timeout_secs` of 0 means no timeout.
    fn create_command(&self, text: &str, timeout_secs: u32) -> Result<Arc<dyn DbCommand>, DbError>;

    fn set_info_message_handler(&self, handler: Option<InfoMessageHandler>);

    fn close(&self) -> Result<(), DbError>;
}

/// Opens connections on behalf of the SQLCMD `:connect` directive.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn DbConnection>, DbError>;
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub server: String,
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub database: Option<String>,
    pub timeout_secs: u32,
}

impl ConnectionInfo {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            username: None,
            password: None,
            database: None,
            timeout_secs: 0,
        }
    }

    /// Integrated security when no user name is given.
    pub fn is_integrated(&self) -> bool {
        self.username.is_none()
    }

    pub fn connection_string(&self) -> String {
        let mut parts = vec![format!("Server={}", self.server)];
        if let Some(database) = &self.database {
            parts.push(format!("Database={database}"));
        }
        match &self.username {
            Some(username) => {
                parts.push(format!("User Id={username}"));
                parts.push("Password=***".to_string());
            }
            None => parts.push("Integrated Security=true".to_string()),
        }
        if self.timeout_secs > 0 {
            parts.push(format!("Connect Timeout={}", self.timeout_secs));
        }
        parts.join(";")
    }
}

// Keep the password out of logs.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("{what} lock was poisoned; recovering.");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_masks_password() {
        let mut info = ConnectionInfo::new("db01");
        info.username = Some("sa".to_string());
        info.password = Some("hunter2".to_string());
        info.database = Some("Sales".to_string());

        let text = info.connection_string();
        assert_eq!(
            text,
            "Server=db01;Database=Sales;User Id=sa;Password=***"
        );
        assert!(!format!("{info:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&info).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_integrated_security_without_user() {
        let mut info = ConnectionInfo::new("db01");
        info.timeout_secs = 15;

        assert!(info.is_integrated());
        assert_eq!(
            info.connection_string(),
            "Server=db01;Integrated Security=true;Connect Timeout=15"
        );
    }

    #[test]
    fn test_server_error_classes() {
        assert!(!ServerError::new(50000, 10, 1, "info").is_error());
        assert!(ServerError::new(0, 11, 1, "error").is_error());
    }

    #[test]
    fn test_server_errors_display_together() {
        let err = DbError::Server(vec![
            ServerError::new(1, 16, 1, "first"),
            ServerError::new(2, 16, 1, "second"),
        ]);
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let poisoner = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        *lock_or_recover(&mutex, "test value") += 1;
        assert_eq!(*lock_or_recover(&mutex, "test value"), 2);
    }
}
