//! Mock plot sensors for local development.
//!
//! Two profiles, chosen with `SIM_SCENARIO`:
//! - `uniform`: every reading is independent, moisture in 10..=95 and light
//!   in 200..=800.
//! - `drift`: each plot follows its own random walk with mean reversion, so
//!   consecutive readings stay close and plots diverge over time.

use std::fmt;

pub const MOISTURE_MAX: i64 = 100;
pub const LIGHT_MAX: i64 = 1000;

/// Approximate a sample from N(0,1): sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Uniform,
    Drift,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "drift" => Self::Drift,
            _ => Self::Uniform,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform => write!(f, "uniform"),
            Self::Drift => write!(f, "drift"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-plot state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub moisture: i64,
    pub light: i64,
}

struct PlotState {
    moisture: f64,
    light: f64,
    /// Where this plot's moisture settles.
    moisture_center: f64,
}

pub struct PlotSim {
    scenario: Scenario,
    plots: Vec<PlotState>,
    mean_reversion: f64,
    moisture_sigma: f64,
    light_sigma: f64,
}

impl PlotSim {
    pub fn new(scenario: Scenario, plot_count: usize) -> Self {
        let plots = (0..plot_count)
            .map(|_| {
                let center = gaussian(55.0, 12.0).clamp(20.0, 85.0);
                PlotState {
                    moisture: center + gaussian(0.0, 5.0),
                    light: fastrand::i64(200..=800) as f64,
                    moisture_center: center,
                }
            })
            .collect();

        Self {
            scenario,
            plots,
            mean_reversion: 0.05,
            moisture_sigma: 2.5,
            light_sigma: 40.0,
        }
    }

    /// Next reading for the plot at `index`.
    pub fn sample(&mut self, index: usize) -> Sample {
        match self.scenario {
            Scenario::Uniform => Sample {
                moisture: fastrand::i64(10..=95),
                light: fastrand::i64(200..=800),
            },
            Scenario::Drift => {
                let plot = &mut self.plots[index];

                let pull = self.mean_reversion * (plot.moisture_center - plot.moisture);
                plot.moisture = (plot.moisture + pull + gaussian(0.0, self.moisture_sigma))
                    .clamp(0.0, MOISTURE_MAX as f64);

                let light_pull = self.mean_reversion * (500.0 - plot.light);
                plot.light = (plot.light + light_pull + gaussian(0.0, self.light_sigma))
                    .clamp(0.0, LIGHT_MAX as f64);

                Sample {
                    moisture: plot.moisture.round() as i64,
                    light: plot.light.round() as i64,
                }
            }
        }
    }

    pub fn plot_count(&self) -> usize {
        self.plots.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_stays_in_documented_ranges() {
        let mut sim = PlotSim::new(Scenario::Uniform, 3);
        for _ in 0..500 {
            for i in 0..3 {
                let s = sim.sample(i);
                assert!((10..=95).contains(&s.moisture), "moisture: {}", s.moisture);
                assert!((200..=800).contains(&s.light), "light: {}", s.light);
            }
        }
    }

    #[test]
    fn drift_stays_clamped() {
        let mut sim = PlotSim::new(Scenario::Drift, 2);
        for _ in 0..2000 {
            for i in 0..2 {
                let s = sim.sample(i);
                assert!((0..=MOISTURE_MAX).contains(&s.moisture));
                assert!((0..=LIGHT_MAX).contains(&s.light));
            }
        }
    }

    #[test]
    fn drift_is_temporally_coherent() {
        let mut sim = PlotSim::new(Scenario::Drift, 1);
        let samples: Vec<i64> = (0..200).map(|_| sim.sample(0).moisture).collect();
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .max()
            .unwrap();
        // Step sigma is 2.5, so 6 sigma plus the mean-reversion pull.
        assert!(max_jump < 25, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn plot_count_matches() {
        assert_eq!(PlotSim::new(Scenario::Drift, 8).plot_count(), 8);
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drift"), Scenario::Drift);
        assert_eq!(Scenario::from_str_lossy(" DRIFT "), Scenario::Drift);
        assert_eq!(Scenario::from_str_lossy("uniform"), Scenario::Uniform);
        assert_eq!(Scenario::from_str_lossy("bogus"), Scenario::Uniform);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Uniform);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Uniform.to_string(), "uniform");
        assert_eq!(Scenario::Drift.to_string(), "drift");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
