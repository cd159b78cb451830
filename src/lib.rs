// sqlgate - read-only PostgreSQL wire protocol server backed by SQLite.
//
// The backing database file can be swapped atomically while clients stay
// connected; see `Server::reload`.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

// Shared types and errors
pub mod core;

// Embedded read-only store boundary
pub mod store;

// Wire protocol, authentication, query engine, server
pub mod network;

pub use crate::core::ServerError;
pub use crate::network::{Server, ServerOptions};
pub use crate::store::{ColumnInfo, QueryEvent, SqliteStore, Store};
