//! Load averages
//!
//! Sampled every five simulated seconds. Each sample folds the number of
//! runnable tasks into three exponentially decaying averages with windows
//! of one, five and fifteen minutes.

use akern_api::Nanoseconds;

/// Sampling interval
pub const LOAD_FREQ_NS: Nanoseconds = 5_000_000_000;

const WINDOWS_SECS: [f64; 3] = [60.0, 300.0, 900.0];

/// 1, 5 and 15 minute load averages
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
    last_sample_ns: Nanoseconds,
}

impl LoadAverage {
    /// Folds in every whole sampling interval elapsed up to `now`
    pub fn update(&mut self, now: Nanoseconds, runnable: usize) {
        if now < self.last_sample_ns.saturating_add(LOAD_FREQ_NS) {
            return;
        }
        let periods = (now - self.last_sample_ns) / LOAD_FREQ_NS;
        self.last_sample_ns += periods * LOAD_FREQ_NS;
        let elapsed_secs = periods as f64 * (LOAD_FREQ_NS / 1_000_000_000) as f64;
        let n = runnable as f64;
        for (avg, window) in [&mut self.one, &mut self.five, &mut self.fifteen]
            .into_iter()
            .zip(WINDOWS_SECS)
        {
            let decay = libm::exp(-elapsed_secs / window);
            *avg = *avg * decay + n * (1.0 - decay);
        }
    }

    /// The three averages
    pub fn as_array(&self) -> [f64; 3] {
        [self.one, self.five, self.fifteen]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_towards_load() {
        let mut load = LoadAverage::default();
        load.update(LOAD_FREQ_NS - 1, 4);
        assert_eq!(load.one, 0.0);
        load.update(LOAD_FREQ_NS * 120, 4);
        assert!(load.one > 3.9 && load.one <= 4.0);
        assert!(load.fifteen < load.five && load.five < load.one);
    }
}
