pub mod config;
pub mod errors;
pub mod index;
pub(crate) mod heap;
pub(crate) mod serialization;

pub use config::Config;
pub use errors::{IndexError, Result};
