use time::OffsetDateTime;

pub trait Clock {
    fn now(&self) -> OffsetDateTime;

    fn now_unix(&self) -> i64 {
        self.now().unix_timestamp()
    }
}

#[derive(Clone)]
pub struct SystemClock {}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Frozen clock for tests, so "not in the future" checks are deterministic.
#[derive(Clone)]
pub struct FixedClock {
    pub now: OffsetDateTime,
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.now
    }
}
