//! Interval token computation.
//!
//! `__interval` and friends are fixed tokens substituted into queries before
//! variable substitution. The raw interval is the visible time range divided
//! by the panel's pixel width, then rounded up to a human-friendly unit so
//! charts bucket on boundaries people expect.

use crate::types::TimeRange;

/// Rounding ladder in milliseconds: 1ms up to 30 days.
const LADDER_MS: &[i64] = &[
    1,
    2,
    5,
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    15_000,
    30_000,
    60_000,
    120_000,
    300_000,
    600_000,
    900_000,
    1_800_000,
    3_600_000,
    7_200_000,
    10_800_000,
    21_600_000,
    43_200_000,
    86_400_000,
    604_800_000,
    2_592_000_000,
];

/// Assumed scrape interval for `__rate_interval`, in milliseconds.
const SCRAPE_INTERVAL_MS: i64 = 15_000;

/// Substitutable interval tokens for one panel run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalTokens {
    /// Human-friendly form, e.g. `30s`, `5m`, `1h`.
    pub interval: String,
    pub interval_ms: i64,
    /// At least four scrape intervals, never shorter than `interval`.
    pub rate_interval: String,
}

/// Compute interval tokens from the visible time range and panel width.
pub fn compute_interval(time_range: &TimeRange, width_px: u32) -> IntervalTokens {
    let width = width_px.max(1) as i64;
    let range_ms = (time_range.duration_micros() / 1_000).max(1);
    let raw_ms = (range_ms / width).max(1);

    let interval_ms = LADDER_MS
        .iter()
        .copied()
        .find(|step| *step >= raw_ms)
        .unwrap_or_else(|| *LADDER_MS.last().unwrap_or(&1));

    let rate_ms = interval_ms.max(4 * SCRAPE_INTERVAL_MS);

    IntervalTokens {
        interval: format_duration_ms(interval_ms),
        interval_ms,
        rate_interval: format_duration_ms(rate_ms),
    }
}

/// Render a millisecond duration in the largest unit that divides it.
pub fn format_duration_ms(ms: i64) -> String {
    const UNITS: &[(i64, &str)] = &[
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    for (unit_ms, suffix) in UNITS {
        if ms >= *unit_ms && ms % unit_ms == 0 {
            return format!("{}{}", ms / unit_ms, suffix);
        }
    }
    format!("{}ms", ms)
}
