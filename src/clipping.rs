//! Robust statistics and kernel-sum outlier rejection.

use tracing::debug;

use crate::candidate::{CandidateStatus, KernelCandidate, RejectionReason, SolutionKind};
use crate::image::Pixel;
use crate::Result;

/// IQR to gaussian sigma
const IQR_TO_SIGMA: f64 = 0.741;

/// Value at fraction `p` of the sorted data (nearest rank).
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut values = values.to_vec();
    values.sort_by(|a, b| a.total_cmp(b));
    let idx = (p * (values.len() - 1) as f64).round() as usize;
    values[idx.min(values.len() - 1)]
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 0.5)
}

/// median and IQR-based sigma
pub fn robust_stats(values: &[f64]) -> (f64, f64) {
    let q25 = percentile(values, 0.25);
    let q75 = percentile(values, 0.75);
    (median(values), IQR_TO_SIGMA * (q75 - q25))
}

/// Reject candidates whose kernel sum lies more than `max_sigma` robust
/// standard deviations from the median. Only GOOD candidates with a `kind`
/// solution take part; returns the ids rejected.
pub fn clip_kernel_sums<T: Pixel>(
    candidates: &mut [&mut KernelCandidate<'_, T>],
    kind: SolutionKind,
    max_sigma: f64,
) -> Result<Vec<usize>> {
    let mut sums = Vec::with_capacity(candidates.len());
    for cand in candidates.iter() {
        if cand.status() == CandidateStatus::Good && cand.is_built(kind) {
            sums.push(cand.kernel_sum(kind)?);
        }
    }
    if sums.len() < 3 {
        return Ok(vec![]);
    }
    let (median, sigma) = robust_stats(&sums);
    debug!("kernel sum median {:.5}, sigma {:.5}", median, sigma);
    if sigma < 1e-12 {
        return Ok(vec![]);
    }

    let mut rejected = vec![];
    for cand in candidates.iter_mut() {
        if cand.status() != CandidateStatus::Good || !cand.is_built(kind) {
            continue;
        }
        let sum = cand.kernel_sum(kind)?;
        if (sum - median).abs() > max_sigma * sigma {
            debug!(
                "candidate {} kernel sum {:.5} outside {:.5} +/- {:.1} sigma",
                cand.id(),
                sum,
                median,
                max_sigma
            );
            cand.reject(RejectionReason::KernelSumOutlier);
            rejected.push(cand.id());
        }
    }
    Ok(rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_percentile() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];
        assert_eq!(median(&values), 3.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 5.0);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_robust_stats_ignore_outlier() {
        let mut values: Vec<f64> = (0..9).map(|i| 1.0 + 0.01 * i as f64).collect();
        values.push(100.0);
        let (med, sigma) = robust_stats(&values);
        assert!(med < 1.1);
        assert!(sigma < 0.1);
        assert_abs_diff_eq!(sigma, 0.741 * (percentile(&values, 0.75) - percentile(&values, 0.25)));
    }
}
