//! Trailing time-window moving average.
//!
//! Every raw sensor reading passes through a [`TimeAverager`] before the
//! decision engine sees it, so one noisy reading cannot flip the fan.

use std::collections::VecDeque;

use atticfan_types::Millis;

/// A single timestamped raw value.
#[derive(Debug, Clone, Copy)]
struct TimedValue {
    t: Millis,
    value: f64,
}

/// Moving average over all values added in the last `window` milliseconds.
///
/// Values must be added in non-decreasing time order.
///
/// # Example
///
/// ```
/// use atticfan_core::TimeAverager;
///
/// let mut avg = TimeAverager::new(3 * 60 * 1000);
/// assert_eq!(avg.add(20.0, 0), Some(20.0));
/// assert_eq!(avg.add(22.0, 10_000), Some(21.0));
/// // the first two values are now outside the window
/// assert_eq!(avg.add(30.0, 10 * 60 * 1000), Some(30.0));
/// ```
#[derive(Debug, Clone)]
pub struct TimeAverager {
    window: Millis,
    data: VecDeque<TimedValue>,
}

impl TimeAverager {
    /// Create an averager with the given window length.
    pub fn new(window: Millis) -> Self {
        Self {
            window: window.max(0),
            data: VecDeque::new(),
        }
    }

    /// Add a value observed at `now` and return the average of the window
    /// ending at `now`.
    ///
    /// Entries older than `now - window` are discarded in the same backward
    /// pass that sums the retained ones. Returns `None` only if nothing is
    /// left in the window.
    pub fn add(&mut self, value: f64, now: Millis) -> Option<f64> {
        self.data.push_back(TimedValue { t: now, value });

        let mut total = 0.0;
        let mut count = 0usize;
        for item in self.data.iter().rev() {
            if now - item.t > self.window {
                break;
            }
            total += item.value;
            count += 1;
        }

        let stale = self.data.len() - count;
        self.data.drain(..stale);

        if count == 0 {
            None
        } else {
            Some(total / count as f64)
        }
    }

    /// Change the window length. Takes effect on the next [`add`](Self::add).
    pub fn set_window(&mut self, window: Millis) {
        self.window = window.max(0);
    }

    /// Current window length in milliseconds.
    pub fn window(&self) -> Millis {
        self.window
    }

    /// Number of values in the window.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the window holds no values.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
