mod redact;
pub use redact::{sanitize_log_text, MAX_LOG_TEXT_BYTES};
