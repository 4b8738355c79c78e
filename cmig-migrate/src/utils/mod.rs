//! Utility modules for cmig-migrate

pub mod db_retry;
pub mod vendor_retry;

pub use db_retry::retry_on_lock;
pub use vendor_retry::{with_vendor_retry, FailedAttempt, Retried, RetryPolicy};
