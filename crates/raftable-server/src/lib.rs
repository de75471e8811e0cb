//! raftable node binary support
//!
//! - `cli`: command line arguments and their merge with environment configuration
//! - `logging`: console and rolling file output

pub mod cli;
pub mod logging;
