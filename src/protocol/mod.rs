pub mod parser;
pub mod types;

pub use parser::{into_command, RespParser};
pub use types::RespValue;
