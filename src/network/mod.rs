// Network layer: PostgreSQL wire protocol codec, authentication, query
// execution, and the server itself.

pub mod auth;
pub mod pg_protocol;
pub mod query;
pub mod server;

pub use server::{Server, ServerOptions};
