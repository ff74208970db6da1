use chrono::{DateTime, Utc};
use std::fmt;

/// Source of capture timestamps for appended records.
///
/// The ledger clamps whatever this returns so record timestamps never go
/// backwards, so implementations need not be monotonic.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
