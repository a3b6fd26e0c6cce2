//! Account queue loading
//!
//! Reads the batch's account list from a CSV file once at startup.
//! Records are immutable after load; workers only ever borrow them.

mod loader;

pub use loader::{load_accounts, AccountRecord, LoadError};
