use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::fs::Metadata;
use std::os::unix::prelude::MetadataExt;

/// seconds + nanoseconds, used both for index entry timestamps and commit times.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    pub fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn new_i64(sec: i64, nsec: i64) -> Self {
        debug_assert!(sec >= 0 && sec < u32::MAX as i64);
        debug_assert!(nsec >= 0 && nsec < u32::MAX as i64);
        Self::new(sec as u32, nsec as u32)
    }

    pub fn ctime(metadata: &Metadata) -> Self {
        Self::new_i64(metadata.ctime(), metadata.ctime_nsec())
    }

    pub fn mtime(metadata: &Metadata) -> Self {
        Self::new_i64(metadata.mtime(), metadata.mtime_nsec())
    }

    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before unix epoch");
        Self::new(now.as_secs() as u32, now.subsec_nanos())
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sec, self.nsec)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then_with(|| self.nsec.cmp(&other.nsec))
    }
}

/// an epoch time with a timezone offset, used for commit author/committer stamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub epoch_sec: i64,
    /// offset from UTC in minutes
    pub offset_min: i32,
}

impl DateTime {
    pub fn now() -> Self {
        // commit ids depend on this, so tests must not rely on wall-clock
        // values: callers in tests always construct a `DateTime` explicitly.
        let now = chrono::Utc::now();
        Self { epoch_sec: now.timestamp(), offset_min: 0 }
    }

    pub fn new(epoch_sec: i64, offset_min: i32) -> Self {
        Self { epoch_sec, offset_min }
    }
}

impl Display for DateTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.offset_min < 0 { '-' } else { '+' };
        let abs = self.offset_min.unsigned_abs();
        write!(f, "{} {}{:02}{:02}", self.epoch_sec, sign, abs / 60, abs % 60)
    }
}
