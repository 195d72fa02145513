pub mod count_tokens;
pub mod create_message;
pub mod error;
pub mod types;
