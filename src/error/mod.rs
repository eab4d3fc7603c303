mod types;

pub use types::{ActivityError, ActivityResult, Result, RuntimeError};
