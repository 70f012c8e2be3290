//! Types shared by the pgtoken crates: secret handling and config errors.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
