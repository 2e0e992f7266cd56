//! One-minute candle aggregation from live ticks.
//!
//! Bucket boundaries come from tick timestamps, not the wall clock, so a burst of buffered ticks
//! released after reconciliation still lands in the right minutes.

use crate::{
    candle::Candle,
    config::LateTickPolicy,
    instrument::Symbol,
    session::MarketSession,
    tick::Tick,
};
use chrono::{DateTime, Utc};

/// Reason a [`Tick`] did not contribute to any candle.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IgnoreReason {
    /// Tick timestamp is before the session open of its trading date.
    BeforeOpen,
    /// Tick has no usable price or quantity.
    Incomplete,
    /// Tick belongs to an already closed minute and [`LateTickPolicy::Drop`] is configured.
    LateDropped,
}

/// Result of feeding a [`Tick`] to a [`CandleAggregator`].
#[derive(Clone, PartialEq, Debug)]
pub enum TickOutcome {
    Ignored(IgnoreReason),
    /// Tick was folded into the candle currently being built.
    Updated,
    /// Tick opened a new minute, `closed` holds the candle it closed (if any).
    Opened { closed: Option<Candle> },
    /// Tick belongs to an earlier, already closed, minute. The caller must load the persisted
    /// candle for `minute` and correct it with [`CandleAggregator::merge_late`].
    Late { minute: DateTime<Utc> },
}

/// Observable state of a [`CandleAggregator`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AggregatorState {
    Idle,
    Building(DateTime<Utc>),
    Closed(DateTime<Utc>),
}

/// Per-symbol tick to one-minute [`Candle`] state machine.
///
/// Owned by exactly one worker task, so it holds no locks.
#[derive(Debug)]
pub struct CandleAggregator {
    symbol: Symbol,
    session: MarketSession,
    threshold: u64,
    late_policy: LateTickPolicy,
    current: Option<Candle>,
    /// Most recent minute ever opened, ticks before it are late.
    latest_minute: Option<DateTime<Utc>>,
}

impl CandleAggregator {
    pub fn new(
        symbol: Symbol,
        session: MarketSession,
        threshold: u64,
        late_policy: LateTickPolicy,
    ) -> Self {
        Self {
            symbol,
            session,
            threshold,
            late_policy,
            current: None,
            latest_minute: None,
        }
    }

    /// Feed a [`Tick`] through the state machine.
    pub fn update(&mut self, tick: &Tick) -> TickOutcome {
        if !tick.is_complete() {
            return TickOutcome::Ignored(IgnoreReason::Incomplete);
        }
        if self.session.is_before_open(tick.time) {
            return TickOutcome::Ignored(IgnoreReason::BeforeOpen);
        }

        let minute = tick.minute();
        match self.latest_minute {
            Some(latest) if minute < latest => match self.late_policy {
                LateTickPolicy::Merge => TickOutcome::Late { minute },
                LateTickPolicy::Drop => TickOutcome::Ignored(IgnoreReason::LateDropped),
            },
            Some(latest) if minute == latest && self.current.is_some() => {
                if let Some(candle) = self.current.as_mut() {
                    candle.apply_tick(tick, self.threshold);
                }
                TickOutcome::Updated
            }
            // Same minute as a flushed candle: the persisted version must be corrected
            Some(latest) if minute == latest => match self.late_policy {
                LateTickPolicy::Merge => TickOutcome::Late { minute },
                LateTickPolicy::Drop => TickOutcome::Ignored(IgnoreReason::LateDropped),
            },
            _ => {
                let candle = self.open(tick);
                let closed = self.current.replace(candle);
                self.latest_minute = Some(minute);
                TickOutcome::Opened { closed }
            }
        }
    }

    /// Correct the persisted candle of a late tick's minute, opening a fresh candle if nothing
    /// was persisted for it.
    pub fn merge_late(&self, stored: Option<Candle>, tick: &Tick) -> Candle {
        match stored {
            Some(mut candle) => {
                candle.apply_late_tick(tick, self.threshold);
                candle
            }
            None => self.open(tick),
        }
    }

    /// Minute a [`Tick`] would open if this aggregator has not opened any minute yet.
    ///
    /// The caller should load the persisted candle of that minute (eg/ flushed by a previous
    /// subscription of the symbol) and [`CandleAggregator::resume`] it before applying the
    /// tick, otherwise the new candle replaces rather than extends the persisted one.
    pub fn first_minute(&self, tick: &Tick) -> Option<DateTime<Utc>> {
        let opens = self.latest_minute.is_none()
            && tick.is_complete()
            && !self.session.is_before_open(tick.time);
        opens.then(|| tick.minute())
    }

    /// Continue building a persisted candle, ticks of its minute are folded into it.
    ///
    /// Has no effect once a minute has been opened.
    pub fn resume(&mut self, candle: Candle) {
        if self.latest_minute.is_some() {
            return;
        }
        self.latest_minute = Some(candle.minute);
        self.current = Some(candle);
    }

    /// Close and return the candle currently being built, if any.
    pub fn flush(&mut self) -> Option<Candle> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn state(&self) -> AggregatorState {
        match (&self.current, self.latest_minute) {
            (Some(candle), _) => AggregatorState::Building(candle.minute),
            (None, Some(minute)) => AggregatorState::Closed(minute),
            (None, None) => AggregatorState::Idle,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    fn open(&self, tick: &Tick) -> Candle {
        Candle::from_tick(
            self.symbol.clone(),
            self.session.local_date(tick.time),
            tick,
            self.threshold,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{candle::CandleSource, instrument::InstrumentKey};
    use chrono::{FixedOffset, NaiveTime, TimeDelta, TimeZone};

    fn aggregator(policy: LateTickPolicy) -> CandleAggregator {
        let session = MarketSession::new(
            NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            FixedOffset::east_opt(330 * 60).unwrap(),
        );
        CandleAggregator::new(Symbol::new("NSE", "TATASTEEL"), session, 10_000, policy)
    }

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 4, minute, second).unwrap()
    }

    fn tick(time: DateTime<Utc>, price: f64, quantity: u64) -> Tick {
        Tick {
            instrument: InstrumentKey::new("NSE_EQ|INE081A01020"),
            time,
            price,
            quantity,
            sequence: 0,
        }
    }

    #[test]
    fn test_aggregator_minute_alignment() {
        let mut agg = aggregator(LateTickPolicy::Merge);
        assert_eq!(agg.state(), AggregatorState::Idle);

        // First tick opens the 04:30 bucket
        assert_eq!(
            agg.update(&tick(at(30, 1), 100.0, 1)),
            TickOutcome::Opened { closed: None }
        );

        // 04:30:59.999 is the same bucket
        let edge = at(30, 59) + TimeDelta::milliseconds(999);
        assert_eq!(agg.update(&tick(edge, 101.0, 1)), TickOutcome::Updated);
        assert_eq!(agg.state(), AggregatorState::Building(at(30, 0)));

        // 04:31:00 closes it
        let TickOutcome::Opened { closed: Some(candle) } = agg.update(&tick(at(31, 0), 102.0, 1))
        else {
            panic!("expected 04:30 candle to close");
        };
        assert_eq!(candle.minute, at(30, 0));
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 101.0);
        assert_eq!(candle.high, 101.0);
        assert_eq!(candle.low, 100.0);
        assert_eq!(candle.volume, 2);
        assert_eq!(candle.source, CandleSource::Live);
        assert_eq!(agg.state(), AggregatorState::Building(at(31, 0)));
    }

    #[test]
    fn test_aggregator_uses_tick_timestamps() {
        let mut agg = aggregator(LateTickPolicy::Merge);

        // Burst of buffered ticks spanning 6 minutes of tick time, every 720ms
        let closed = (0..500)
            .map(|i| tick(at(30, 0) + TimeDelta::milliseconds(i * 720), 150.0 + i as f64 * 0.1, 1))
            .filter_map(|tick| match agg.update(&tick) {
                TickOutcome::Opened { closed } => closed,
                _ => None,
            })
            .collect::<Vec<_>>();

        // 500 * 720ms = 360s spans minutes 04:30..04:35, the last is still building
        assert_eq!(closed.len(), 5);
        assert!(closed.windows(2).all(|pair| pair[0].minute < pair[1].minute));
        assert_eq!(closed.iter().map(|c| c.volume).sum::<u64>(), 5 * 60_000 / 720 + 1);
        assert!(closed.iter().all(Candle::is_consistent));
        assert_eq!(agg.flush().map(|c| c.minute), Some(at(35, 0)));
    }

    #[test]
    fn test_aggregator_ignored_ticks() {
        struct TestCase {
            input: Tick,
            expected: TickOutcome,
        }

        let tests = vec![
            TestCase {
                // TC0: before the 09:15 IST open
                input: tick(Utc.with_ymd_and_hms(2024, 6, 3, 3, 44, 59).unwrap(), 100.0, 5),
                expected: TickOutcome::Ignored(IgnoreReason::BeforeOpen),
            },
            TestCase {
                // TC1: zero quantity
                input: tick(at(30, 0), 100.0, 0),
                expected: TickOutcome::Ignored(IgnoreReason::Incomplete),
            },
            TestCase {
                // TC2: zero price
                input: tick(at(30, 0), 0.0, 5),
                expected: TickOutcome::Ignored(IgnoreReason::Incomplete),
            },
            TestCase {
                // TC3: first valid tick of the session
                input: tick(Utc.with_ymd_and_hms(2024, 6, 3, 3, 45, 0).unwrap(), 100.0, 5),
                expected: TickOutcome::Opened { closed: None },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut agg = aggregator(LateTickPolicy::Merge);
            assert_eq!(agg.update(&test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_aggregator_late_tick_policy() {
        struct TestCase {
            policy: LateTickPolicy,
            expected: TickOutcome,
        }

        let tests = vec![
            TestCase {
                // TC0: merge policy asks for a correction
                policy: LateTickPolicy::Merge,
                expected: TickOutcome::Late { minute: at(30, 0) },
            },
            TestCase {
                // TC1: drop policy ignores the tick
                policy: LateTickPolicy::Drop,
                expected: TickOutcome::Ignored(IgnoreReason::LateDropped),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut agg = aggregator(test.policy);
            agg.update(&tick(at(30, 10), 100.0, 5));
            agg.update(&tick(at(31, 10), 101.0, 5));

            let actual = agg.update(&tick(at(30, 45), 99.0, 5));
            assert_eq!(actual, test.expected, "TC{} failed", index);

            // Building candle is untouched
            let current = agg.current().unwrap();
            assert_eq!(current.minute, at(31, 0), "TC{} failed", index);
            assert_eq!(current.volume, 5, "TC{} failed", index);
        }
    }

    #[test]
    fn test_aggregator_merge_late() {
        let mut agg = aggregator(LateTickPolicy::Merge);
        agg.update(&tick(at(30, 10), 100.0, 5));
        let TickOutcome::Opened { closed: Some(stored) } = agg.update(&tick(at(31, 10), 101.0, 5))
        else {
            panic!("expected 04:30 candle to close");
        };

        let late = tick(at(30, 50), 97.0, 20_000);
        assert_eq!(agg.update(&late), TickOutcome::Late { minute: at(30, 0) });

        let corrected = agg.merge_late(Some(stored), &late);
        assert_eq!(corrected.minute, at(30, 0));
        assert_eq!(corrected.low, 97.0);
        assert_eq!(corrected.close, 97.0);
        assert_eq!(corrected.volume, 20_005);
        assert!(corrected.big_player);

        // Nothing persisted for the minute yet
        let fresh = agg.merge_late(None, &late);
        assert_eq!(fresh.volume, 20_000);
        assert_eq!(fresh.open, 97.0);
    }

    #[test]
    fn test_aggregator_resume_persisted_candle() {
        let mut previous = aggregator(LateTickPolicy::Merge);
        previous.update(&tick(at(30, 10), 100.0, 10));
        let persisted = previous.flush().unwrap();

        let mut agg = aggregator(LateTickPolicy::Merge);
        let next = tick(at(30, 40), 101.0, 5);
        assert_eq!(agg.first_minute(&next), Some(at(30, 0)));

        agg.resume(persisted);
        assert_eq!(agg.first_minute(&next), None);
        assert_eq!(agg.update(&next), TickOutcome::Updated);

        let TickOutcome::Opened { closed: Some(candle) } = agg.update(&tick(at(31, 1), 102.0, 1))
        else {
            panic!("expected 04:30 candle to close");
        };
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 101.0);
        assert_eq!(candle.volume, 15);
        assert_eq!(candle.first_trade_at, at(30, 10));
    }

    #[test]
    fn test_aggregator_first_minute() {
        struct TestCase {
            input: Tick,
            expected: Option<DateTime<Utc>>,
        }

        let tests = vec![
            TestCase {
                // TC0: valid tick
                input: tick(at(30, 10), 100.0, 1),
                expected: Some(at(30, 0)),
            },
            TestCase {
                // TC1: before the open
                input: tick(Utc.with_ymd_and_hms(2024, 6, 3, 3, 0, 0).unwrap(), 100.0, 1),
                expected: None,
            },
            TestCase {
                // TC2: incomplete
                input: tick(at(30, 10), 100.0, 0),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let agg = aggregator(LateTickPolicy::Merge);
            assert_eq!(agg.first_minute(&test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_aggregator_flush() {
        let mut agg = aggregator(LateTickPolicy::Merge);
        assert!(agg.flush().is_none());

        agg.update(&tick(at(30, 10), 100.0, 5));
        agg.update(&tick(at(30, 20), 100.5, 50_000));

        let partial = agg.flush().unwrap();
        assert_eq!(partial.volume, 50_005);
        assert!(partial.big_player);
        assert_eq!(agg.state(), AggregatorState::Closed(at(30, 0)));

        // A tick for the flushed minute is a correction, not a second candle
        assert_eq!(
            agg.update(&tick(at(30, 30), 100.0, 1)),
            TickOutcome::Late { minute: at(30, 0) }
        );
    }
}
