pub mod error;

pub use error::{LifecycleError, Result};
