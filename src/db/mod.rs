pub mod connection;
pub mod script;
pub mod session;

pub use connection::*;
pub use script::*;
pub use session::*;
