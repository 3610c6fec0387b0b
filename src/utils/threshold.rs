//! Baseline intensity thresholding
//!
//! Provides Otsu's method on a bimodal histogram, used to separate tissue
//! from background on the baseline (b=0) image.

/// Default histogram resolution for the baseline threshold
pub const DEFAULT_OTSU_BINS: usize = 128;

/// Scale applied to the Otsu threshold so borderline tissue voxels are kept
pub const BASELINE_THRESHOLD_SCALE: f64 = 0.9;

/// Otsu's method for automatic threshold selection
///
/// Finds the histogram bin that maximizes inter-class variance and returns
/// the upper edge of that bin, so the bin itself falls into the background
/// class. The histogram spans the full data range including zeros.
///
/// # Arguments
/// * `data` - Input data (e.g. flattened baseline image)
/// * `num_bins` - Number of histogram bins
///
/// # Returns
/// The optimal threshold value
pub fn otsu_threshold(data: &[f64], num_bins: usize) -> f64 {
    let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || num_bins == 0 {
        return 0.0;
    }

    let min_val = finite.iter().fold(f64::MAX, |a, &b| a.min(b));
    let max_val = finite.iter().fold(f64::MIN, |a, &b| a.max(b));

    if (max_val - min_val).abs() < 1e-10 {
        return min_val;
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let mut histogram = vec![0usize; num_bins];

    for &v in &finite {
        let bin = ((v - min_val) / bin_width).floor() as usize;
        let bin = bin.min(num_bins - 1);
        histogram[bin] += 1;
    }

    let total = finite.len() as f64;

    let mut sum_total = 0.0;
    for (i, &count) in histogram.iter().enumerate() {
        sum_total += i as f64 * count as f64;
    }

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut max_variance = 0.0;
    let mut optimal_bin = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }

        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }

        sum_background += t as f64 * count as f64;

        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_total - sum_background) / weight_foreground;

        let variance = weight_background * weight_foreground
            * (mean_background - mean_foreground).powi(2);

        if variance > max_variance {
            max_variance = variance;
            optimal_bin = t;
        }
    }

    min_val + (optimal_bin + 1) as f64 * bin_width
}

/// Baseline threshold: scaled Otsu threshold of the baseline image
pub fn baseline_threshold(baseline: &[f64], num_bins: usize) -> f64 {
    BASELINE_THRESHOLD_SCALE * otsu_threshold(baseline, num_bins)
}

/// Binary mask of voxels whose baseline reaches `threshold`
///
/// Inside voxels are 1, not the maximum of the output pixel type.
pub fn threshold_mask(baseline: &[f64], threshold: f64) -> Vec<u8> {
    baseline.iter().map(|&v| if v >= threshold { 1 } else { 0 }).collect()
}
