use std::collections::VecDeque;
use std::sync::Mutex;

/// Number of instruction costs the mean is computed over.
pub const CPI_WINDOW: usize = 500;

/// Arithmetic mean of the last N per-instruction cycle counts. The UI
/// thread reads the mean while the driver keeps feeding samples, hence
/// the internal lock.
pub struct CpiWindow {
    inner: Mutex<Inner>,
}

struct Inner {
    samples: VecDeque<u32>,
    sum: u64,
    capacity: usize,
}

impl CpiWindow {
    pub fn new(capacity: usize) -> Self {
        CpiWindow {
            inner: Mutex::new(Inner { samples: VecDeque::with_capacity(capacity), sum: 0, capacity }),
        }
    }

    /// Record the cycle cost of one instruction, evicting the oldest
    /// sample once the window is full.
    pub fn add(&self, cost: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.samples.len() == inner.capacity {
            if let Some(oldest) = inner.samples.pop_front() {
                inner.sum -= u64::from(oldest);
            }
        }
        inner.samples.push_back(cost);
        inner.sum += u64::from(cost);
    }

    /// Mean of the recorded samples, or 0 when none have been recorded.
    pub fn mean(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        if inner.samples.is_empty() {
            return 0.0;
        }
        inner.sum as f64 / inner.samples.len() as f64
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.clear();
        inner.sum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn empty_window_has_zero_mean() {
        let window = CpiWindow::new(4);
        assert_eq!(window.mean(), 0.0);
    }

    #[test]
    fn mean_of_partial_window() {
        let window = CpiWindow::new(10);
        window.add(2);
        window.add(4);
        assert_eq!(window.mean(), 3.0);
    }

    #[test]
    fn full_window_evicts_oldest() {
        let window = CpiWindow::new(3);
        for cost in [10u32, 2, 2, 2] {
            window.add(cost);
        }
        // The 10 has been pushed out
        assert_eq!(window.mean(), 2.0);
    }

    #[test]
    fn reset_clears_samples() {
        let window = CpiWindow::new(3);
        window.add(7);
        window.reset();
        assert_eq!(window.mean(), 0.0);
        window.add(3);
        assert_eq!(window.mean(), 3.0);
    }

    quickcheck! {
        fn mean_matches_last_n_samples(samples: Vec<u8>) -> bool {
            let window = CpiWindow::new(5);
            for &s in &samples {
                window.add(u32::from(s));
            }
            if samples.is_empty() {
                return window.mean() == 0.0;
            }
            let tail: Vec<u64> = samples.iter().rev().take(5).map(|&s| u64::from(s)).collect();
            let expected = tail.iter().sum::<u64>() as f64 / tail.len() as f64;
            (window.mean() - expected).abs() < 1e-9
        }
    }
}
