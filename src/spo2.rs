// PulseWatch — Heart Rate & SpO2 Estimation
//
// Turns one window of paired red/IR samples into a heart rate and a blood
// oxygen estimate, each with its own validity flag.
//
// Back-ends:
//   1. Native (default): autocorrelation pitch detection for the heart rate,
//      ratio-of-ratios for SpO2, gated on the red/IR Pearson correlation.
//   2. FFI: enable the `rf-algorithm` feature and point `RF_ALGORITHM_DIR`
//      at the vendor C sources; build.rs compiles them and this module links
//      `rf_heart_rate_and_oxygen_saturation` instead.

use crate::config::*;

// ---------------------------------------------------------------------------
// Public interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Estimate {
    pub heart_rate: i32,
    pub heart_rate_valid: bool,
    pub spo2: f32,
    pub spo2_valid: bool,
    /// Diagnostic only: red/IR ratio-of-ratios.
    pub ratio: f32,
    /// Diagnostic only: red/IR Pearson correlation.
    pub correlation: f32,
}

impl Estimate {
    pub fn is_valid(&self) -> bool {
        self.heart_rate_valid && self.spo2_valid
    }
}

/// The numeric step of the acquisition pipeline.
pub trait SignalProcessor {
    fn estimate(&mut self, ir: &[u32], red: &[u32]) -> Estimate;
}

/// Robert Fraczkiewicz's method, natively or through the linked C routine.
#[derive(Debug, Clone, Copy, Default)]
pub struct RfEstimator;

impl SignalProcessor for RfEstimator {
    fn estimate(&mut self, ir: &[u32], red: &[u32]) -> Estimate {
        #[cfg(not(feature = "rf-algorithm"))]
        {
            native::estimate(ir, red)
        }

        #[cfg(feature = "rf-algorithm")]
        {
            ffi_estimate(ir, red)
        }
    }
}

// ---------------------------------------------------------------------------
// Native back-end
// ---------------------------------------------------------------------------
pub mod native {
    use super::*;

    /// Shortest and longest beat period searched, in samples (~187 to ~40 bpm).
    pub const LOWEST_PERIOD: usize = 8;
    pub const HIGHEST_PERIOD: usize = 37;

    pub const MIN_PEARSON_CORRELATION: f64 = 0.8;
    pub const MIN_AUTOCORRELATION_RATIO: f64 = 0.5;

    const RATIO_RANGE: (f64, f64) = (0.02, 1.84);

    pub fn estimate(ir: &[u32], red: &[u32]) -> Estimate {
        let n = ir.len().min(red.len());
        if n < HIGHEST_PERIOD + 2 {
            return Estimate::default();
        }

        let ir_mean = mean(&ir[..n]);
        let red_mean = mean(&red[..n]);
        if ir_mean < FINGER_PRESENCE_THRESHOLD as f64 || red_mean <= 0.0 {
            return Estimate::default();
        }

        let mut x: Vec<f64> = ir[..n].iter().map(|&v| v as f64 - ir_mean).collect();
        let mut y: Vec<f64> = red[..n].iter().map(|&v| v as f64 - red_mean).collect();
        detrend(&mut x);
        detrend(&mut y);

        let correlation = pearson(&x, &y);
        let heart_rate = beat_period(&x).map(|period| (60.0 * SAMPLE_RATE_HZ as f64 / period).round() as i32);

        let ratio = (rms(&y) / red_mean) / (rms(&x) / ir_mean);
        let spo2_valid = correlation >= MIN_PEARSON_CORRELATION && ratio > RATIO_RANGE.0 && ratio < RATIO_RANGE.1;
        let spo2 = if spo2_valid { spo2_curve(ratio) } else { 0.0 };

        log::debug!(
            "estimate: hr={:?} ratio={:.3} correl={:.3} spo2={:.2}",
            heart_rate,
            ratio,
            correlation,
            spo2
        );

        Estimate {
            heart_rate: heart_rate.unwrap_or(0),
            heart_rate_valid: heart_rate.is_some(),
            spo2: spo2 as f32,
            spo2_valid,
            ratio: ratio as f32,
            correlation: correlation as f32,
        }
    }

    /// Empirical calibration of the Maxim reference design.
    pub fn spo2_curve(ratio: f64) -> f64 {
        (-45.060 * ratio + 30.354) * ratio + 94.845
    }

    fn mean(samples: &[u32]) -> f64 {
        samples.iter().map(|&v| v as f64).sum::<f64>() / samples.len() as f64
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    /// Remove the least-squares line through a zero-mean signal.
    fn detrend(x: &mut [f64]) {
        let mid = (x.len() as f64 - 1.0) / 2.0;
        let (num, den) = x.iter().enumerate().fold((0.0, 0.0), |(num, den), (i, v)| {
            let t = i as f64 - mid;
            (num + t * v, den + t * t)
        });
        if den == 0.0 {
            return;
        }
        let slope = num / den;
        for (i, v) in x.iter_mut().enumerate() {
            *v -= slope * (i as f64 - mid);
        }
    }

    fn pearson(x: &[f64], y: &[f64]) -> f64 {
        let xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
        let xx: f64 = x.iter().map(|a| a * a).sum();
        let yy: f64 = y.iter().map(|b| b * b).sum();
        let den = (xx * yy).sqrt();
        if den == 0.0 {
            0.0
        } else {
            xy / den
        }
    }

    fn autocorrelation(x: &[f64], lag: usize) -> f64 {
        x.iter().zip(&x[lag..]).map(|(a, b)| a * b).sum()
    }

    /// Beat period in (fractional) samples: the first autocorrelation peak in
    /// the search range that is strong enough, refined by a parabola fit.
    fn beat_period(x: &[f64]) -> Option<f64> {
        let acf0 = autocorrelation(x, 0);
        if acf0 <= 0.0 {
            return None;
        }

        // One extra lag on each side so every candidate has both neighbours.
        let acf: Vec<f64> = (LOWEST_PERIOD - 1..=HIGHEST_PERIOD + 1)
            .map(|lag| autocorrelation(x, lag))
            .collect();

        let peak = (1..acf.len() - 1).find(|&i| {
            acf[i] >= acf[i - 1] && acf[i] >= acf[i + 1] && acf[i] >= MIN_AUTOCORRELATION_RATIO * acf0
        })?;

        let (y1, y2, y3) = (acf[peak - 1], acf[peak], acf[peak + 1]);
        let curvature = y1 - 2.0 * y2 + y3;
        let offset = if curvature == 0.0 { 0.0 } else { 0.5 * (y1 - y3) / curvature };
        Some((LOWEST_PERIOD - 1 + peak) as f64 + offset)
    }
}

// ---------------------------------------------------------------------------
// FFI back-end: calls the compiled vendor C routine
// ---------------------------------------------------------------------------
#[cfg(feature = "rf-algorithm")]
mod ffi {
    extern "C" {
        pub fn rf_heart_rate_and_oxygen_saturation(
            pun_ir_buffer: *const u32,
            n_ir_buffer_length: i32,
            pun_red_buffer: *const u32,
            pn_spo2: *mut f32,
            pch_spo2_valid: *mut i8,
            pn_heart_rate: *mut i32,
            pch_hr_valid: *mut i8,
            ratio: *mut f32,
            correl: *mut f32,
        );
    }
}

#[cfg(feature = "rf-algorithm")]
fn ffi_estimate(ir: &[u32], red: &[u32]) -> Estimate {
    let n = ir.len().min(red.len());
    let Ok(len) = i32::try_from(n) else {
        return Estimate::default();
    };

    let mut spo2 = 0.0f32;
    let mut spo2_valid = 0i8;
    let mut heart_rate = 0i32;
    let mut hr_valid = 0i8;
    let mut ratio = 0.0f32;
    let mut correl = 0.0f32;

    // SAFETY: both buffers hold at least `len` samples and the routine only
    // reads them; every out-pointer refers to a live local.
    unsafe {
        ffi::rf_heart_rate_and_oxygen_saturation(
            ir.as_ptr(),
            len,
            red.as_ptr(),
            &mut spo2,
            &mut spo2_valid,
            &mut heart_rate,
            &mut hr_valid,
            &mut ratio,
            &mut correl,
        );
    }

    log::debug!("rf: hr={} ({}) spo2={:.2} ({}) ratio={:.3} correl={:.3}", heart_rate, hr_valid, spo2, spo2_valid, ratio, correl);

    Estimate {
        heart_rate,
        heart_rate_valid: hr_valid != 0,
        spo2,
        spo2_valid: spo2_valid != 0,
        ratio,
        correlation: correl,
    }
}

#[cfg(test)]
mod tests {
    use super::native::*;
    use super::*;
    use std::f64::consts::TAU;

    /// `len` samples of a `bpm` pulse riding on `dc` with peak amplitude `ac`.
    fn pulse(len: usize, bpm: f64, dc: f64, ac: f64) -> Vec<u32> {
        let hz = bpm / 60.0;
        (0..len)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE_HZ as f64;
                (dc + ac * (TAU * hz * t).sin()).round() as u32
            })
            .collect()
    }

    #[test]
    fn steady_pulse_gives_rate_and_saturation() {
        let ir = pulse(SAMPLE_WINDOW_LEN, 72.0, 100_000.0, 1_500.0);
        let red = pulse(SAMPLE_WINDOW_LEN, 72.0, 60_000.0, 450.0);
        let estimate = estimate(&ir, &red);

        assert!(estimate.is_valid(), "{estimate:?}");
        assert!((70..=74).contains(&estimate.heart_rate), "{estimate:?}");
        assert!((estimate.ratio - 0.5).abs() < 0.02, "{estimate:?}");
        assert!((98.5..99.0).contains(&estimate.spo2), "{estimate:?}");
        assert!(estimate.correlation > 0.99);
    }

    #[test]
    fn slower_pulse_is_tracked() {
        let ir = pulse(SAMPLE_WINDOW_LEN, 60.0, 90_000.0, 2_000.0);
        let red = pulse(SAMPLE_WINDOW_LEN, 60.0, 50_000.0, 700.0);
        let estimate = estimate(&ir, &red);
        assert!(estimate.heart_rate_valid);
        assert!((58..=62).contains(&estimate.heart_rate), "{estimate:?}");
    }

    #[test]
    fn no_finger_is_invalid() {
        let ir = pulse(SAMPLE_WINDOW_LEN, 72.0, 5_000.0, 100.0);
        let red = pulse(SAMPLE_WINDOW_LEN, 72.0, 4_000.0, 50.0);
        let estimate = estimate(&ir, &red);
        assert!(!estimate.heart_rate_valid);
        assert!(!estimate.spo2_valid);
    }

    #[test]
    fn flat_signal_has_no_heart_rate() {
        let flat = vec![80_000u32; SAMPLE_WINDOW_LEN];
        let estimate = estimate(&flat, &flat);
        assert!(!estimate.heart_rate_valid);
        assert!(!estimate.is_valid());
    }

    #[test]
    fn anticorrelated_channels_fail_the_saturation_gate() {
        let ir = pulse(SAMPLE_WINDOW_LEN, 72.0, 100_000.0, 1_500.0);
        let red: Vec<u32> = pulse(SAMPLE_WINDOW_LEN, 72.0, 60_000.0, 450.0)
            .into_iter()
            .map(|r| 2 * 60_000 - r)
            .collect();
        let estimate = estimate(&ir, &red);
        assert!(estimate.correlation < 0.0);
        assert!(!estimate.spo2_valid);
    }

    #[test]
    fn short_window_is_rejected() {
        let ir = pulse(20, 72.0, 100_000.0, 1_500.0);
        assert_eq!(estimate(&ir, &ir), Estimate::default());
    }

    #[test]
    fn calibration_curve_matches_reference_points() {
        assert!((spo2_curve(0.5) - 98.757).abs() < 0.001);
        assert!((spo2_curve(1.0) - 80.139).abs() < 0.001);
    }

    #[test]
    fn trait_object_uses_the_configured_backend() {
        let ir = pulse(SAMPLE_WINDOW_LEN, 72.0, 100_000.0, 1_500.0);
        let red = pulse(SAMPLE_WINDOW_LEN, 72.0, 60_000.0, 450.0);
        let mut processor: Box<dyn SignalProcessor> = Box::new(RfEstimator);
        assert!(processor.estimate(&ir, &red).heart_rate_valid);
    }
}
