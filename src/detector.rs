//! Hysteresis state machine turning noisy bps samples into risk windows.
//!
//! A breach must hold for the full grace period (inclusive boundary)
//! before a window opens; the window is deemed to have begun at the
//! first breaching sample, not when the grace period elapsed. A breach
//! that heals early produces no event at all.
//!
//! One instance per monitored market. Callers must feed samples in
//! non-decreasing timestamp order; the polling loop guards that, not
//! the detector.

/// Which side of the threshold is unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Value below the threshold is breaching (reserve-ratio floor).
    Min,
    /// Value above the threshold is breaching (price-deviation ceiling).
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start {
        start: i64,
        value_bps: i64,
    },
    End {
        start: i64,
        end: i64,
        value_bps: i64,
    },
}

#[derive(Debug)]
pub struct HysteresisDetector {
    threshold_bps: i64,
    grace_period_secs: i64,
    guard: Guard,
    breach_started_at: Option<i64>,
    window_start: Option<i64>,
    active: bool,
}

impl HysteresisDetector {
    pub fn new(threshold_bps: i64, grace_period_secs: u64, guard: Guard) -> Self {
        Self {
            threshold_bps,
            grace_period_secs: grace_period_secs as i64,
            guard,
            breach_started_at: None,
            window_start: None,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn window_start(&self) -> Option<i64> {
        self.window_start
    }

    fn is_breaching(&self, value_bps: i64) -> bool {
        match self.guard {
            Guard::Min => value_bps < self.threshold_bps,
            Guard::Max => value_bps > self.threshold_bps,
        }
    }

    /// Advance the machine by one sample. At most one transition is
    /// emitted per call; `None` means internal state only changed.
    pub fn on_sample(&mut self, timestamp: i64, value_bps: i64) -> Option<Transition> {
        if self.is_breaching(value_bps) {
            let breach_start = *self.breach_started_at.get_or_insert(timestamp);
            if !self.active && timestamp - breach_start >= self.grace_period_secs {
                self.active = true;
                self.window_start = Some(breach_start);
                return Some(Transition::Start {
                    start: breach_start,
                    value_bps,
                });
            }
            return None;
        }

        // Safe side of the threshold.
        if self.active {
            let start = self.window_start.take().unwrap_or(timestamp);
            self.active = false;
            self.breach_started_at = None;
            return Some(Transition::End {
                start,
                end: timestamp,
                value_bps,
            });
        }
        self.breach_started_at = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(grace: u64) -> HysteresisDetector {
        HysteresisDetector::new(9_500, grace, Guard::Min)
    }

    #[test]
    fn test_short_dip_emits_nothing() {
        let mut d = detector(600);
        assert_eq!(d.on_sample(1_000, 9_400), None);
        assert_eq!(d.on_sample(1_599, 9_400), None); // grace - 1
        assert_eq!(d.on_sample(1_600, 9_600), None); // healed before grace
        assert!(!d.is_active());
    }

    #[test]
    fn test_start_emitted_at_first_breach_timestamp() {
        let mut d = detector(600);
        assert_eq!(d.on_sample(1_000, 9_400), None);
        assert_eq!(d.on_sample(1_300, 9_300), None);
        let event = d.on_sample(1_600, 9_200);
        assert_eq!(
            event,
            Some(Transition::Start {
                start: 1_000,
                value_bps: 9_200
            })
        );
        assert!(d.is_active());
        assert_eq!(d.window_start(), Some(1_000));
    }

    #[test]
    fn test_grace_boundary_is_inclusive() {
        let mut d = detector(600);
        assert_eq!(d.on_sample(0, 9_000), None);
        // exactly grace seconds after first breach
        assert!(matches!(
            d.on_sample(600, 9_000),
            Some(Transition::Start { start: 0, .. })
        ));
    }

    #[test]
    fn test_end_on_recovery() {
        let mut d = detector(600);
        d.on_sample(0, 9_000);
        d.on_sample(600, 9_000);
        assert!(d.is_active());
        let event = d.on_sample(1_200, 9_600);
        assert_eq!(
            event,
            Some(Transition::End {
                start: 0,
                end: 1_200,
                value_bps: 9_600
            })
        );
        assert!(!d.is_active());
        assert_eq!(d.window_start(), None);
    }

    #[test]
    fn test_single_active_window() {
        let mut d = detector(60);
        let samples: Vec<(i64, i64)> = (0..50)
            .map(|i| {
                let ts = i * 30;
                // oscillates into long breaches and recoveries
                let value = if (i / 10) % 2 == 0 { 9_000 } else { 9_900 };
                (ts, value)
            })
            .collect();

        let mut starts = 0;
        let mut ends = 0;
        for (ts, value) in samples {
            match d.on_sample(ts, value) {
                Some(Transition::Start { .. }) => {
                    starts += 1;
                    assert_eq!(starts, ends + 1, "two starts without intervening end");
                }
                Some(Transition::End { .. }) => ends += 1,
                None => {}
            }
        }
        assert!(starts > 1);
        assert!(starts - ends <= 1);
    }

    #[test]
    fn test_still_breaching_while_active_is_silent() {
        let mut d = detector(60);
        d.on_sample(0, 9_000);
        assert!(d.on_sample(60, 9_000).is_some());
        assert_eq!(d.on_sample(120, 8_500), None);
        assert_eq!(d.on_sample(180, 8_000), None);
        assert!(d.is_active());
    }

    #[test]
    fn test_max_guard_variant() {
        // deviation ceiling: breaching when above threshold
        let mut d = HysteresisDetector::new(200, 0, Guard::Max);
        assert_eq!(
            d.on_sample(10, 250),
            Some(Transition::Start {
                start: 10,
                value_bps: 250
            })
        );
        assert_eq!(d.on_sample(20, 300), None);
        assert_eq!(
            d.on_sample(30, 150),
            Some(Transition::End {
                start: 10,
                end: 30,
                value_bps: 150
            })
        );
    }
}
