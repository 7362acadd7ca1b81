pub mod anchor;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod ledger;
pub mod retry;
pub mod verify;

pub use error::{LedgerError, Result};
