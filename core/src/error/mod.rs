pub mod engine;

pub use engine::{EngineError, ErrorCode};
