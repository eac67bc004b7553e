//! Scalar measurements, aggregating a stream of numeric samples.

/// Aggregates a stream of samples into a single scalar.
///
/// Used by limit algorithms to track e.g. minimum observed latency or smoothed
/// average latency.
pub trait Measurement {
    /// Add a sample to the aggregation.
    ///
    /// Returns the new aggregated value.
    fn add(&mut self, sample: f64) -> f64;

    /// The current aggregated value.
    fn get(&self) -> f64;

    /// Forget all samples.
    fn reset(&mut self);

    /// Apply an arbitrary transform to the current value.
    fn update<F: FnOnce(f64) -> f64>(&mut self, f: F);
}

/// The smallest sample added since the last reset.
///
/// Emptiness is tracked explicitly, so a genuine zero-valued sample is
/// distinguishable from "no samples yet".
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Minimum {
    value: Option<f64>,
}

impl Minimum {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any sample has been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

impl Measurement for Minimum {
    fn add(&mut self, sample: f64) -> f64 {
        let min = match self.value {
            Some(value) => value.min(sample),
            None => sample,
        };
        self.value = Some(min);
        min
    }

    /// Returns `0.0` when no samples have been added.
    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    fn reset(&mut self) {
        self.value = None;
    }

    fn update<F: FnOnce(f64) -> f64>(&mut self, f: F) {
        if let Some(value) = self.value {
            self.value = Some(f(value));
        }
    }
}

/// The most recently added sample.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SingleValue {
    value: f64,
}

impl SingleValue {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Measurement for SingleValue {
    fn add(&mut self, sample: f64) -> f64 {
        self.value = sample;
        sample
    }

    fn get(&self) -> f64 {
        self.value
    }

    fn reset(&mut self) {
        self.value = 0.0;
    }

    fn update<F: FnOnce(f64) -> f64>(&mut self, f: F) {
        self.value = f(self.value);
    }
}

/// An [exponential moving average](https://en.wikipedia.org/wiki/Exponential_smoothing).
///
/// During an initial warmup period the samples are folded with a combining
/// function instead, biasing the starting value. The default combiner is
/// [`f64::min`], appropriate for latency baselines.
///
/// > Exponential smoothing puts substantial weight on past observations, so the initial value
/// > of demand will have an unreasonably large effect on early forecasts.
/// >
/// > [Source](https://en.wikipedia.org/wiki/Exponential_smoothing#Choosing_the_initial_smoothed_value)
#[derive(Debug, Clone)]
pub struct ExpAvg {
    /// Smoothing factor `α`. Weighting for the incoming sample.
    ///
    /// 0 < `α` < 1
    smoothing_factor: f64,

    warmup_window: u32,
    warmup_combiner: fn(f64, f64) -> f64,

    count: u32,
    value: f64,
}

impl ExpAvg {
    /// An average over a window of `k` samples, with the first
    /// `warmup` samples combined with [`f64::min`].
    pub fn new(k: u32, warmup: u32) -> Self {
        Self {
            smoothing_factor: Self::smoothing_for_window(k),
            warmup_window: warmup,
            warmup_combiner: f64::min,
            count: 0,
            value: 0.0,
        }
    }

    /// Replace the warmup combining function.
    pub fn with_warmup_combiner(self, combiner: fn(f64, f64) -> f64) -> Self {
        Self {
            warmup_combiner: combiner,
            ..self
        }
    }

    fn smoothing_for_window(k: u32) -> f64 {
        assert!(k > 0, "window size must be > 0");

        2.0 / f64::from(k + 1)
    }
}

impl Measurement for ExpAvg {
    fn add(&mut self, sample: f64) -> f64 {
        if self.count == 0 {
            self.value = sample;
        } else if self.count < self.warmup_window {
            self.value = (self.warmup_combiner)(self.value, sample);
        } else {
            self.value += (sample - self.value) * self.smoothing_factor;
        }
        self.count = self.count.saturating_add(1);
        self.value
    }

    fn get(&self) -> f64 {
        self.value
    }

    fn reset(&mut self) {
        self.count = 0;
        self.value = 0.0;
    }

    fn update<F: FnOnce(f64) -> f64>(&mut self, f: F) {
        self.value = f(self.value);
    }
}
