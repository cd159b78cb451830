// Shared types and errors.

mod error;

pub use error::ServerError;
