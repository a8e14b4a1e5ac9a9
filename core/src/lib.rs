mod error;

pub mod device;
pub mod rule;

pub use error::{Error, Result};
