use serde::{Deserialize, Serialize};

/// Least-squares fit `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

/// Fit a line through `(ln x, ln y)`. Points with non-positive or
/// non-finite coordinates are skipped; fewer than two usable points give
/// `None`.
pub fn log_log_regression(x: &[f64], y: &[f64]) -> Option<Regression> {
    let points: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite() && **a > 0.0 && **b > 0.0)
        .map(|(a, b)| (a.ln(), b.ln()))
        .collect();
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    let syy: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 {
        1.0
    } else {
        (sxy * sxy) / (sxx * syy)
    };
    Some(Regression {
        slope,
        intercept,
        r_squared,
    })
}

/// `log(e_coarse / e_fine) / log(h_coarse / h_fine)`
pub fn observed_order(e_coarse: f64, e_fine: f64, h_coarse: f64, h_fine: f64) -> Option<f64> {
    let valid = |v: f64| v.is_finite() && v > 0.0;
    let finite = valid(e_coarse) && valid(e_fine) && valid(h_coarse) && valid(h_fine);
    if !finite || h_coarse == h_fine {
        return None;
    }
    Some((e_coarse / e_fine).ln() / (h_coarse / h_fine).ln())
}
