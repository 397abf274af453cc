use std::fmt;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};

/// Source of "now" and of the business day used to decide whether a view is
/// live (today) or frozen (a past date).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date of `now` in the business timezone.
    fn today(&self) -> NaiveDate;

    /// Offset of the business timezone, used for rendered times.
    fn offset(&self) -> FixedOffset {
        Utc.fix()
    }
}

/// Wall clock with a fixed business-timezone offset.
#[derive(Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Creates a clock whose business day is shifted by `offset_minutes`
    /// from UTC.
    pub fn new(offset_minutes: i32) -> Result<Self> {
        let Some(offset) = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
        else {
            bail!("utc offset of {offset_minutes} minutes is out of range");
        };
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock")
            .field("offset", &self.offset)
            .finish()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.offset).date_naive()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually driven clock for tests and replays. Its business timezone is UTC
/// unless set with [`ManualClock::with_offset`].
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
            offset: Utc.fix(),
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.lock())
            .field("offset", &self.offset)
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.offset).date_naive()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}
