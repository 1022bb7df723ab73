//! Push-key generation for append-only collections.
//!
//! Keys sort lexicographically in generation order: a fixed-width
//! millisecond timestamp prefix plus a per-millisecond counter. The
//! store layer assigns these on append, which makes chat appends
//! idempotent and gives `chat::ordered` its tie-breaker.

use chrono::{DateTime, Utc};

/// Width of the zero-padded millisecond prefix. 13 decimal digits
/// cover timestamps until the year 2286.
const TS_WIDTH: usize = 13;

/// Monotonic push-key generator for one session.
#[derive(Debug, Default)]
pub struct PushKeyGen {
    last_ms: i64,
    counter: u32,
}

impl PushKeyGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next key, e.g. `"0001700000000000-0000"`.
    ///
    /// Clock regressions reuse the last seen timestamp so keys stay
    /// monotonic within the session.
    pub fn next(&mut self, now: DateTime<Utc>) -> String {
        let ms = now.timestamp_millis().max(self.last_ms);
        if ms == self.last_ms {
            self.counter += 1;
        } else {
            self.last_ms = ms;
            self.counter = 0;
        }
        format!("{ms:0width$}-{counter:04}", width = TS_WIDTH, counter = self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("valid ts")
    }

    #[test]
    fn keys_sort_in_generation_order() {
        let mut generator = PushKeyGen::new();
        let keys = [
            generator.next(at(1_000)),
            generator.next(at(1_000)),
            generator.next(at(1_001)),
            generator.next(at(2_000)),
        ];
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.iter().collect::<std::collections::HashSet<_>>().len(), 4);
    }

    #[test]
    fn clock_regression_stays_monotonic() {
        let mut generator = PushKeyGen::new();
        let a = generator.next(at(5_000));
        let b = generator.next(at(4_000));
        assert!(b > a, "regressed clock must not produce an earlier key");
    }
}
