//! Splits SQL Server scripts into batches and runs them against a
//! connection, with SQLCMD variables and directives.

pub mod db;
pub mod utils;
