//! Linear projection of hourly series

use crate::analyzer::{classify_change, mean};
use crate::models::{Forecast, Trend};

/// Points compared at each end of a forecast when labelling its trend
pub const TREND_WINDOW: usize = 6;

/// Least-squares line over a standardized sample index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearModel {
    x_mean: f64,
    x_scale: f64,
    slope: f64,
    intercept: f64,
}

impl LinearModel {
    /// Fit against indices `0..values.len()`
    pub fn fit(values: &[f64]) -> Self {
        let n = values.len() as f64;
        if values.len() < 2 {
            return Self {
                x_mean: 0.0,
                x_scale: 1.0,
                slope: 0.0,
                intercept: mean(values),
            };
        }

        let x_mean = (n - 1.0) / 2.0;
        let x_var = (0..values.len())
            .map(|i| (i as f64 - x_mean).powi(2))
            .sum::<f64>()
            / n;
        let x_scale = x_var.sqrt().max(f64::EPSILON);
        let z: Vec<f64> = (0..values.len())
            .map(|i| (i as f64 - x_mean) / x_scale)
            .collect();

        let sum_z: f64 = z.iter().sum();
        let sum_y: f64 = values.iter().sum();
        let sum_zy: f64 = z.iter().zip(values).map(|(z, y)| z * y).sum();
        let sum_z2: f64 = z.iter().map(|z| z.powi(2)).sum();
        let denom = n * sum_z2 - sum_z.powi(2);
        let slope = if denom.abs() < f64::EPSILON {
            0.0
        } else {
            (n * sum_zy - sum_z * sum_y) / denom
        };
        let intercept = (sum_y - slope * sum_z) / n;

        Self {
            x_mean,
            x_scale,
            slope,
            intercept,
        }
    }

    pub fn predict(&self, index: f64) -> f64 {
        self.intercept + self.slope * (index - self.x_mean) / self.x_scale
    }

    /// Change per index step in the original units
    pub fn slope_per_step(&self) -> f64 {
        self.slope / self.x_scale
    }

    /// Predictions for indices `start..start + count`
    pub fn project(&self, start: usize, count: usize) -> Vec<f64> {
        (start..start + count)
            .map(|i| self.predict(i as f64))
            .collect()
    }
}

/// Compare the mean of the first and last forecast points
pub fn classify_forecast_trend(values: &[f64], threshold: f64) -> Trend {
    if values.len() < 2 {
        return Trend::Stable;
    }
    let window = TREND_WINDOW.min(values.len());
    let first = mean(&values[..window]);
    let last = mean(&values[values.len() - window..]);
    classify_change(first, last, threshold)
}

/// Index of the highest value, earliest on ties
pub fn peak_hour(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |(best, max), (i, v)| {
            if *v > max {
                (i, *v)
            } else {
                (best, max)
            }
        })
        .0
}

/// Project `horizon` points from a history series
///
/// Short histories repeat their average instead of extrapolating.
/// Projections never go below zero.
pub fn forecast_series(
    values: &[f64],
    horizon: usize,
    min_samples: usize,
    trend_threshold: f64,
) -> Forecast {
    let next_horizon: Vec<f64> = if values.len() < min_samples.max(2) {
        vec![mean(values); horizon]
    } else {
        LinearModel::fit(values)
            .project(values.len(), horizon)
            .into_iter()
            .map(|v| v.max(0.0))
            .collect()
    };

    Forecast {
        trend: classify_forecast_trend(&next_horizon, trend_threshold),
        peak_hour_index: peak_hour(&next_horizon),
        next_horizon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_recovers_line() {
        let values: Vec<f64> = (0..30).map(|i| 10.0 + 2.0 * i as f64).collect();
        let model = LinearModel::fit(&values);

        assert!((model.slope_per_step() - 2.0).abs() < 1e-9);
        assert!((model.predict(30.0) - 70.0).abs() < 1e-9);
        assert_eq!(model.project(30, 3).len(), 3);
    }

    #[test]
    fn test_fit_degenerate_inputs() {
        assert_eq!(LinearModel::fit(&[]).predict(5.0), 0.0);
        assert_eq!(LinearModel::fit(&[7.0]).predict(5.0), 7.0);
        assert!(LinearModel::fit(&[3.0, 3.0, 3.0]).slope_per_step().abs() < 1e-12);
    }

    #[test]
    fn test_increasing_series_forecasts_increasing() {
        let values: Vec<f64> = (0..48).map(|i| 20.0 + i as f64).collect();
        let forecast = forecast_series(&values, 24, 24, 0.1);

        assert_eq!(forecast.next_horizon.len(), 24);
        assert_eq!(forecast.trend, Trend::Increasing);
        assert_eq!(forecast.peak_hour_index, 23);
    }

    #[test]
    fn test_flat_series_forecasts_stable() {
        let values = vec![35.0; 30];
        let forecast = forecast_series(&values, 12, 24, 0.1);

        assert_eq!(forecast.trend, Trend::Stable);
        assert!(forecast.next_horizon.iter().all(|v| (v - 35.0).abs() < 1e-9));
    }

    #[test]
    fn test_short_history_is_flat_average() {
        let values = vec![10.0, 20.0, 30.0];
        let forecast = forecast_series(&values, 5, 24, 0.1);

        assert_eq!(forecast.next_horizon, vec![20.0; 5]);
        assert_eq!(forecast.trend, Trend::Stable);
        assert_eq!(forecast.peak_hour_index, 0);
    }

    #[test]
    fn test_decreasing_series_forecasts_decreasing() {
        let values: Vec<f64> = (0..24).map(|i| 100.0 - i as f64).collect();
        let forecast = forecast_series(&values, 24, 24, 0.1);

        assert_eq!(forecast.trend, Trend::Decreasing);
        assert_eq!(forecast.peak_hour_index, 0);
    }

    #[test]
    fn test_projection_never_negative() {
        let values: Vec<f64> = (0..24).map(|i| 24.0 - i as f64).collect();
        let forecast = forecast_series(&values, 24, 24, 0.1);

        assert!(forecast.next_horizon.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_peak_hour_prefers_earliest() {
        assert_eq!(peak_hour(&[1.0, 5.0, 3.0, 5.0]), 1);
        assert_eq!(peak_hour(&[]), 0);
    }
}
