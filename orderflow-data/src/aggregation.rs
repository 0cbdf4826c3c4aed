/// Aggregation utilities shared by the footprint and power-trade modules
use crate::types::Tick;

/// Volume-Weighted Average Price (VWAP) over a set of ticks
///
/// VWAP = Σ(Price × Volume) / Σ(Volume)
pub fn calculate_vwap<'a>(ticks: impl IntoIterator<Item = &'a Tick>) -> Option<f64> {
    let mut sum_pv = 0.0;
    let mut sum_v = 0.0;

    for tick in ticks {
        sum_pv += tick.price * tick.volume;
        sum_v += tick.volume;
    }

    if sum_v > 0.0 {
        Some(sum_pv / sum_v)
    } else {
        None
    }
}

/// Align a millisecond timestamp to the start of its bar.
///
/// Uses tick timestamps (not wall clock) for bar boundaries so backfill and live data land in
/// the same bars. Negative timestamps floor towards the earlier bar.
#[inline]
pub fn align_to_bar(time: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return time;
    }
    time.div_euclid(interval_ms) * interval_ms
}

/// Number of decimal places needed to represent a tick size exactly (capped at 10).
pub fn step_decimals(step: f64) -> u32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 10 && (scaled - scaled.round()).abs() > 1e-9 * scaled.abs().max(1.0) {
        decimals += 1;
        scaled = step * 10f64.powi(decimals as i32);
    }
    decimals
}

/// Round a value to a fixed number of decimal places.
#[inline]
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn tick(price: f64, volume: f64) -> Tick {
        Tick::new(0, price, volume, Side::Buy).unwrap()
    }

    #[test]
    fn test_vwap_calculation() {
        let ticks = vec![tick(100.0, 1.0), tick(101.0, 2.0), tick(99.0, 1.0)];

        let vwap = calculate_vwap(&ticks).unwrap();
        assert!((vwap - 100.25).abs() < 0.01);
    }

    #[test]
    fn test_vwap_empty() {
        assert_eq!(calculate_vwap(&[]), None);
        assert_eq!(calculate_vwap(&[tick(100.0, 0.0)]), None);
    }

    #[test]
    fn test_align_to_bar() {
        assert_eq!(align_to_bar(61_500, 60_000), 60_000);
        assert_eq!(align_to_bar(60_000, 60_000), 60_000);
        assert_eq!(align_to_bar(59_999, 60_000), 0);
        assert_eq!(align_to_bar(-1, 60_000), -60_000);
        assert_eq!(align_to_bar(1234, 0), 1234);
    }

    #[test]
    fn test_step_decimals() {
        struct TestCase {
            step: f64,
            expected: u32,
        }

        let tests = vec![
            // TC0: whole step
            TestCase { step: 1.0, expected: 0 },
            // TC1: paise
            TestCase { step: 0.05, expected: 2 },
            // TC2: quarter
            TestCase { step: 0.25, expected: 2 },
            // TC3: fine crypto step
            TestCase { step: 0.0001, expected: 4 },
            // TC4: coarse step
            TestCase { step: 10.0, expected: 0 },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(step_decimals(test.step), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_round_to_decimals() {
        assert_eq!(round_to_decimals(2001.0 * 0.05, 2), 100.05);
        assert_eq!(round_to_decimals(0.1 + 0.2, 2), 0.3);
    }
}
