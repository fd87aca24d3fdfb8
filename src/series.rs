//! Calibrated rate series.
//!
//! Historical rates (birth rate, natural mortality, condom coverage) are
//! calibrated as yearly points. Queries inside the observed range interpolate
//! linearly; queries beyond it either hold the last value or extend the
//! recent trend, optionally tapered toward a life-expectancy-implied target
//! so century-long projections do not run off linearly forever.

use serde::{Deserialize, Serialize};

/// Number of trailing observed years used to fit the extrapolation slope.
const TREND_WINDOW_YEARS: f64 = 10.0;

/// How a series extends beyond its last observed year.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Projection {
    /// Hold the last observed value.
    #[default]
    Flat,
    /// Extend the slope fitted over the last observed years.
    Trend,
}

/// A scalar rate or a calibrated year-to-value curve.
///
/// `value_at` never fails: it always returns a finite value, clamped to the
/// configured bounds when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSeries {
    /// Observed `(year, value)` points, kept sorted by year.
    pub points: Vec<(f64, f64)>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub projection: Projection,
    /// Years past the last observation at which a tapered projection reaches
    /// full weight on its target (see [`RateSeries::value_at_tapered`]).
    pub taper_horizon: f64,
}

impl Default for RateSeries {
    fn default() -> Self {
        Self {
            points: Vec::new(),
            min: None,
            max: None,
            projection: Projection::Flat,
            taper_horizon: 30.0,
        }
    }
}

impl RateSeries {
    /// A constant rate, identical for every year.
    pub fn scalar(value: f64) -> Self {
        Self {
            points: vec![(0.0, value)],
            ..Self::default()
        }
    }

    /// A series from observed points; sorted by year on construction.
    pub fn from_points(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            points,
            ..Self::default()
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Effective rate at `year` (fractional years allowed).
    pub fn value_at(&self, year: f64) -> f64 {
        self.clamp(self.raw_value_at(year))
    }

    /// Effective rate at `year`, with trend projections blended toward a
    /// target implied by a companion life-expectancy series.
    ///
    /// The target is `k / le(year)` with `k` inferred from the last observed
    /// point, so the projection stays anchored to the observed data while the
    /// taper weight ramps linearly to 1 over `taper_horizon` years.
    pub fn value_at_tapered(&self, year: f64, life_expectancy: &RateSeries) -> f64 {
        let raw = self.raw_value_at(year);
        let Some(&(last_year, last_val)) = self.points.last() else {
            return self.clamp(raw);
        };
        if self.projection != Projection::Trend || year <= last_year {
            return self.clamp(raw);
        }

        let le_now = life_expectancy.value_at(year);
        let le_last = life_expectancy.value_at(last_year);
        if le_now <= 0.0 || le_last <= 0.0 {
            return self.clamp(raw);
        }

        let k = last_val * le_last;
        let target = k / le_now;
        let weight = ((year - last_year) / self.taper_horizon.max(1.0)).clamp(0.0, 1.0);
        self.clamp(raw * (1.0 - weight) + target * weight)
    }

    fn raw_value_at(&self, year: f64) -> f64 {
        let Some(&(first_year, first_val)) = self.points.first() else {
            return 0.0;
        };
        let &(last_year, last_val) = self.points.last().unwrap_or(&(first_year, first_val));

        if year <= first_year {
            return first_val;
        }
        if year <= last_year {
            return interpolate(&self.points, year);
        }

        match self.projection {
            Projection::Flat => last_val,
            Projection::Trend => last_val + self.trend_slope() * (year - last_year),
        }
    }

    /// Slope over the last `TREND_WINDOW_YEARS` of observations.
    fn trend_slope(&self) -> f64 {
        let &(last_year, last_val) = match self.points.last() {
            Some(p) => p,
            None => return 0.0,
        };
        let window_start = last_year - TREND_WINDOW_YEARS;
        let &(base_year, base_val) = self
            .points
            .iter()
            .find(|(y, _)| *y >= window_start)
            .unwrap_or(&(last_year, last_val));
        if last_year - base_year <= f64::EPSILON {
            return 0.0;
        }
        (last_val - base_val) / (last_year - base_year)
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut value = if value.is_finite() { value } else { 0.0 };
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }
}

fn interpolate(points: &[(f64, f64)], year: f64) -> f64 {
    for pair in points.windows(2) {
        let (y0, v0) = pair[0];
        let (y1, v1) = pair[1];
        if year <= y1 {
            if y1 - y0 <= f64::EPSILON {
                return v1;
            }
            let frac = (year - y0) / (y1 - y0);
            return v0 + frac * (v1 - v0);
        }
    }
    points.last().map(|&(_, v)| v).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> RateSeries {
        RateSeries::from_points(vec![(1990.0, 0.040), (2000.0, 0.030), (2010.0, 0.020)])
    }

    #[test]
    fn interpolates_between_points() {
        let s = series();
        assert!((s.value_at(1995.0) - 0.035).abs() < 1e-12);
        assert!((s.value_at(2000.0) - 0.030).abs() < 1e-12);
    }

    #[test]
    fn clamps_before_first_year() {
        assert_eq!(series().value_at(1950.0), 0.040);
    }

    #[test]
    fn flat_projection_holds_last_value() {
        let s = series();
        assert_eq!(s.value_at(2100.0), 0.020);
        assert_eq!(s.value_at(2500.0), 0.020);
    }

    #[test]
    fn trend_projection_follows_slope_sign() {
        let s = series().with_projection(Projection::Trend);
        // Declining series keeps declining.
        assert!(s.value_at(2020.0) < s.value_at(2010.0));
        assert!(s.value_at(2030.0) < s.value_at(2020.0));
    }

    #[test]
    fn bounds_are_enforced() {
        let s = series()
            .with_projection(Projection::Trend)
            .with_bounds(0.005, 1.0);
        // The raw trend goes negative far enough out; the bound holds it.
        assert_eq!(s.value_at(2200.0), 0.005);
    }

    #[test]
    fn taper_reaches_life_expectancy_target() {
        let death = RateSeries::from_points(vec![(2000.0, 0.020), (2010.0, 0.015)])
            .with_projection(Projection::Trend);
        let le = RateSeries::from_points(vec![(2010.0, 60.0), (2040.0, 75.0)]);

        // Past the horizon the value equals k / le exactly.
        let k = 0.015 * 60.0;
        let expected = k / le.value_at(2045.0);
        assert!((death.value_at_tapered(2045.0, &le) - expected).abs() < 1e-12);
    }

    #[test]
    fn never_returns_non_finite() {
        let s = series().with_projection(Projection::Trend);
        for year in [-1.0e9, 0.0, 1990.5, 2009.99, 1.0e9] {
            assert!(s.value_at(year).is_finite());
        }
        assert!(RateSeries::default().value_at(2000.0).is_finite());
    }

    #[test]
    fn scalar_is_year_independent() {
        let s = RateSeries::scalar(0.5);
        assert_eq!(s.value_at(1900.0), 0.5);
        assert_eq!(s.value_at(2100.0), 0.5);
    }
}
