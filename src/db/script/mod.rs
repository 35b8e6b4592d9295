mod conditions;
mod engine;
mod executor;
mod parser;
mod tokenizer;
mod types;

pub use conditions::*;
pub use engine::*;
pub use executor::*;
pub use parser::*;
pub use tokenizer::*;
pub use types::*;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod parser_tests;
