//! Public API of the raftable replicated database.
//!
//! - `model`: tables, versioned values, batch read/write requests and results
//! - `error`: the typed failure taxonomy shared by every layer
//! - `service`: the async `DatabaseService` trait and its convenience operations

pub mod error;
pub mod model;
pub mod service;

pub use error::{DatabaseError, Result};
pub use model::*;
pub use service::DatabaseService;
