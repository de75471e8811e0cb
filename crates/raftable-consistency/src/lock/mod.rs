//! Distributed locks
//!
//! Locks are rows of a reserved TTL table. Acquiring is a conditional insert
//! of the holder's token, releasing a conditional remove of the same token,
//! so a holder can never release a lock it no longer owns.

mod model;
mod service;

pub use model::*;
pub use service::*;
