use chrono::{
    DateTime, DurationRound, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of every candle bucket.
pub const CANDLE_INTERVAL: TimeDelta = TimeDelta::minutes(1);

/// Source of "now" for the pipeline.
///
/// Injected everywhere wall-clock time matters (subscription time, retention cutoff, cache
/// staleness) so replays and tests can drive time explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// [`Clock`] that only moves when told to. Used for replays and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Floor a timestamp to the start of its one-minute bucket.
pub fn minute_bucket(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(CANDLE_INTERVAL).unwrap_or(time)
}

/// Half-open `[start, end)` range of minute buckets.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct MinuteRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MinuteRange {
    /// Construct a [`MinuteRange`], aligning both bounds down to their minute bucket.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: minute_bucket(start),
            end: minute_bucket(end),
        }
    }

    /// Number of minute buckets in the range.
    pub fn len(&self) -> usize {
        if self.end <= self.start {
            return 0;
        }
        usize::try_from((self.end - self.start).num_minutes()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, minute: DateTime<Utc>) -> bool {
        self.start <= minute && minute < self.end
    }

    /// Iterate over the start of every minute bucket in the range.
    pub fn minutes(&self) -> impl Iterator<Item = DateTime<Utc>> + use<> {
        let start = self.start;
        (0..self.len()).map(move |offset| start + CANDLE_INTERVAL * offset as i32)
    }
}

impl fmt::Display for MinuteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%dT%H:%MZ"),
            self.end.format("%Y-%m-%dT%H:%MZ")
        )
    }
}

/// Trading session of an exchange: daily open/close in exchange local time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MarketSession {
    open: NaiveTime,
    close: NaiveTime,
    offset: FixedOffset,
}

impl MarketSession {
    pub fn new(open: NaiveTime, close: NaiveTime, offset: FixedOffset) -> Self {
        Self {
            open,
            close,
            offset,
        }
    }

    /// Exchange local trading date of a timestamp.
    pub fn local_date(&self, time: DateTime<Utc>) -> NaiveDate {
        time.with_timezone(&self.offset).date_naive()
    }

    /// Session open of `date` as a UTC timestamp.
    pub fn market_open(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date.and_time(self.open))
    }

    /// Session close of `date` as a UTC timestamp.
    pub fn market_close(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date.and_time(self.close))
    }

    /// Start and end (exclusive) of the local calendar day `date` as UTC timestamps.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.local_to_utc(date.and_time(NaiveTime::default()));
        (start, start + TimeDelta::days(1))
    }

    /// Determine if `time` falls before the session open of its own trading date.
    pub fn is_before_open(&self, time: DateTime<Utc>) -> bool {
        time < self.market_open(self.local_date(time))
    }

    /// Minutes a subscription made at `subscribed_at` must have backfilled:
    /// `[market open, subscription minute)`, clipped to the session close.
    ///
    /// Returns `None` if the subscription happened before the session opened.
    pub fn coverage_window(&self, subscribed_at: DateTime<Utc>) -> Option<MinuteRange> {
        let date = self.local_date(subscribed_at);
        let start = self.market_open(date);
        let end = minute_bucket(subscribed_at).min(self.market_close(date));

        let window = MinuteRange::new(start, end);
        (!window.is_empty()).then_some(window)
    }

    /// Minute a subscription made at `subscribed_at` observes only in part, because the
    /// subscription started after the minute did.
    ///
    /// `None` if `subscribed_at` is on a minute boundary or outside the session.
    pub fn partial_minute(&self, subscribed_at: DateTime<Utc>) -> Option<MinuteRange> {
        let date = self.local_date(subscribed_at);
        let minute = minute_bucket(subscribed_at);
        let partial = minute != subscribed_at
            && minute >= self.market_open(date)
            && minute < self.market_close(date);

        partial.then(|| MinuteRange {
            start: minute,
            end: minute + CANDLE_INTERVAL,
        })
    }

    fn local_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let naive_utc = local - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(naive_utc, Utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nse() -> MarketSession {
        MarketSession::new(
            NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap(),
        )
    }

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, s).unwrap()
    }

    #[test]
    fn test_minute_bucket() {
        let time = Utc.timestamp_millis_opt(1_717_386_359_999).unwrap();
        assert_eq!(minute_bucket(time), Utc.timestamp_opt(1_717_386_300, 0).unwrap());
        assert_eq!(minute_bucket(utc(4, 30, 0)), utc(4, 30, 0));
    }

    #[test]
    fn test_market_session_open_close_in_utc() {
        let session = nse();
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();

        // 09:15 IST == 03:45 UTC, 15:30 IST == 10:00 UTC
        assert_eq!(session.market_open(date), utc(3, 45, 0));
        assert_eq!(session.market_close(date), utc(10, 0, 0));
        assert!(session.is_before_open(utc(3, 44, 59)));
        assert!(!session.is_before_open(utc(3, 45, 0)));
    }

    #[test]
    fn test_local_date_crosses_utc_midnight() {
        let session = nse();
        // 2024-06-02 20:00 UTC is 2024-06-03 01:30 IST
        let time = Utc.with_ymd_and_hms(2024, 6, 2, 20, 0, 0).unwrap();
        assert_eq!(
            session.local_date(time),
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
        );
    }

    #[test]
    fn test_coverage_window() {
        struct TestCase {
            subscribed_at: DateTime<Utc>,
            expected: Option<(DateTime<Utc>, DateTime<Utc>, usize)>,
        }

        let tests = vec![
            TestCase {
                // TC0: 10:00 IST subscription covers 09:15..10:00
                subscribed_at: utc(4, 30, 0),
                expected: Some((utc(3, 45, 0), utc(4, 30, 0), 45)),
            },
            TestCase {
                // TC1: mid-minute subscription excludes the partial minute
                subscribed_at: utc(4, 30, 42),
                expected: Some((utc(3, 45, 0), utc(4, 30, 0), 45)),
            },
            TestCase {
                // TC2: subscription before open has nothing to backfill
                subscribed_at: utc(3, 0, 0),
                expected: None,
            },
            TestCase {
                // TC3: subscription after close is clipped to the close
                subscribed_at: utc(11, 0, 0),
                expected: Some((utc(3, 45, 0), utc(10, 0, 0), 375)),
            },
            TestCase {
                // TC4: subscription during the opening minute
                subscribed_at: utc(3, 45, 30),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = nse()
                .coverage_window(test.subscribed_at)
                .map(|window| (window.start, window.end, window.len()));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_partial_minute() {
        struct TestCase {
            subscribed_at: DateTime<Utc>,
            expected: Option<DateTime<Utc>>,
        }

        let tests = vec![
            TestCase {
                // TC0: on a minute boundary
                subscribed_at: utc(4, 30, 0),
                expected: None,
            },
            TestCase {
                // TC1: mid-minute
                subscribed_at: utc(4, 30, 30),
                expected: Some(utc(4, 30, 0)),
            },
            TestCase {
                // TC2: during the opening minute
                subscribed_at: utc(3, 45, 30),
                expected: Some(utc(3, 45, 0)),
            },
            TestCase {
                // TC3: before open
                subscribed_at: utc(3, 44, 30),
                expected: None,
            },
            TestCase {
                // TC4: after close
                subscribed_at: utc(10, 0, 30),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = nse().partial_minute(test.subscribed_at);
            assert_eq!(
                actual.map(|range| (range.start, range.len())),
                test.expected.map(|minute| (minute, 1)),
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_minute_range_minutes() {
        let range = MinuteRange::new(utc(3, 45, 10), utc(3, 48, 0));
        let minutes = range.minutes().collect::<Vec<_>>();
        assert_eq!(minutes, vec![utc(3, 45, 0), utc(3, 46, 0), utc(3, 47, 0)]);
        assert!(range.contains(utc(3, 47, 0)));
        assert!(!range.contains(utc(3, 48, 0)));
        assert!(MinuteRange::new(utc(4, 0, 0), utc(3, 0, 0)).is_empty());
    }
}
