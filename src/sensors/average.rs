use std::collections::VecDeque;

/// Moving average over the last `window` samples.
///
/// The first sample fills the whole window, so the average starts at that
/// value instead of ramping up from zero.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Add a sample and return the new average.
    pub fn push(&mut self, sample: f64) -> f64 {
        if self.samples.is_empty() {
            self.samples.extend(std::iter::repeat_n(sample, self.window));
        } else {
            if self.samples.len() == self.window {
                self.samples.pop_back();
            }
            self.samples.push_front(sample);
        }
        self.average().unwrap_or(sample)
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
