pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod kube;
pub mod ledger;
pub mod lock;
pub mod pool;
pub mod restic;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, ErrorKind, Result};
