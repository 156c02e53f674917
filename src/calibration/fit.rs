//! Least-squares straight line.

use average::{Covariance, Estimate, Variance};

use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Fit `y = slope·x + intercept` over paired samples.
pub fn fit_line(xs: &[f64], ys: &[f64]) -> ControlResult<LinearFit> {
    if xs.len() != ys.len() {
        return Err(ControlError::Calibration(format!(
            "{} x values for {} y values",
            xs.len(),
            ys.len()
        )));
    }
    if xs.len() < 2 {
        return Err(ControlError::Calibration("need at least two points to fit a line".into()));
    }

    let mut cov = Covariance::new();
    let mut var = Variance::new();
    for (&x, &y) in xs.iter().zip(ys) {
        cov.add(x, y);
        var.add(x);
    }

    let spread = var.population_variance();
    if !(spread > f64::EPSILON) {
        return Err(ControlError::Calibration(
            "x values do not vary; slope is undefined".into(),
        ));
    }
    let slope = cov.population_covariance() / spread;
    let intercept = cov.mean_y() - slope * cov.mean_x();
    Ok(LinearFit { slope, intercept })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line_is_recovered() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.5 * x - 1.0).collect();
        let fit = fit_line(&xs, &ys).unwrap();
        assert!((fit.slope - 2.5).abs() < 1e-12);
        assert!((fit.intercept + 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_are_errors() {
        assert!(fit_line(&[1.0], &[2.0]).is_err());
        assert!(fit_line(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0]).is_err());
        assert!(fit_line(&[1.0, 2.0], &[2.0]).is_err());
    }

    #[test]
    fn noisy_fit_reproduces_inputs_within_residual() {
        // duty = 0.667·rpm + 10 with small ripple on the measured rpm
        let duties = [20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0];
        let rpms: Vec<f64> = duties
            .iter()
            .enumerate()
            .map(|(i, d)| (d - 10.0) * 1.5 + if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        let fit = fit_line(&rpms, &duties).unwrap();
        for (rpm, duty) in rpms.iter().zip(duties) {
            assert!((fit.eval(*rpm) - duty).abs() < 0.5);
        }
    }
}
