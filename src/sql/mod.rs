pub mod lexer;
pub mod validator;

pub use validator::{RejectReason, SqlValidator, ValidationVerdict};
