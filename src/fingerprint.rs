/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The fingerprint engine. Maps an amplitude window to a set of combinatorial
//! hashes over spectrogram peaks: a log-power short-time spectrogram is
//! computed with a Hann window, 2-D local maxima are extracted, and
//! time-ordered peak pairs within the configured fan-out become
//! `"freq1|freq2|dt"` hash strings anchored at the first peak's time.
//!
//! Construction is deterministic for a given window and parameter set.

pub mod peaks;
pub mod render;

use crate::{config::FingerprintConfig, error::CallsonicResult};
use realfft::RealFftPlanner;
use std::collections::{BTreeMap, HashMap};

/// A 2-D log-power spectrogram slice. Rows are frequency bins (row 0 is DC),
/// columns are time frames.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    values: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl Spectrogram {
    pub fn new(rows: usize, cols: usize) -> Spectrogram {
        Spectrogram {
            values: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.values[row * self.cols + col] = value;
    }
}

/// Spectrogram peak as `(freq_bin, time_frame)`.
pub type Peak = (usize, usize);

#[derive(Debug, Clone)]
pub struct FingerPrint {
    pub print_name: String,
    pub spectrogram: Spectrogram,
    /// Hash string to the anchor peak's time frame.
    pub hashes_offsets: BTreeMap<String, i64>,
    /// Per hash the `(time, freq)` of the anchor peak, for match rendering.
    pub first_points: HashMap<String, (usize, usize)>,
    /// Per hash the `(time, freq)` of the paired peak.
    pub second_points: HashMap<String, (usize, usize)>,
}

impl FingerPrint {
    fn new(print_name: String, spectrogram: Spectrogram) -> FingerPrint {
        FingerPrint {
            print_name,
            spectrogram,
            hashes_offsets: BTreeMap::new(),
            first_points: HashMap::new(),
            second_points: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hashes_offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes_offsets.is_empty()
    }

    fn add_pair(&mut self, hash: String, first: (usize, usize), second: (usize, usize)) {
        self.hashes_offsets.insert(hash.clone(), first.0 as i64);
        self.first_points.insert(hash.clone(), first);
        self.second_points.insert(hash, second);
    }
}

pub fn get_fingerprint(
    print_name: &str,
    amplitudes: &[i16],
    sample_rate: u32,
    params: &FingerprintConfig,
) -> CallsonicResult<FingerPrint> {
    let window_size = params.window_size(sample_rate);

    // two window sizes of silence in front, one behind, so peaks near the
    // window edges get a full neighborhood
    let mut samples = Vec::with_capacity(amplitudes.len() + 3 * window_size);
    samples.resize(2 * window_size, 0.0);
    samples.extend(amplitudes.iter().map(|a| *a as f64));
    samples.resize(samples.len() + window_size, 0.0);

    let spectrogram = compute_spectrogram(&samples, sample_rate, window_size, params.overlap_ratio)?;

    let local_maxima = peaks::get_2d_peaks(
        &spectrogram,
        params.peak_neighborhood_size,
        params.amp_min,
    );

    let skeleton = FingerPrint::new(print_name.to_owned(), spectrogram);
    Ok(generate_hashes(skeleton, local_maxima, params))
}

/// Hann-windowed STFT power spectrogram in dB. Zero-power cells stay zero
/// instead of going to -inf.
fn compute_spectrogram(
    samples: &[f64],
    sample_rate: u32,
    window_size: usize,
    overlap_ratio: f64,
) -> CallsonicResult<Spectrogram> {
    let noverlap = (window_size as f64 * overlap_ratio) as usize;
    let step = (window_size - noverlap).max(1);
    let rows = window_size / 2 + 1;
    let cols = if samples.len() >= window_size {
        (samples.len() - window_size) / step + 1
    } else {
        0
    };

    let window = hann_window(window_size);
    let window_power: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (sample_rate as f64 * window_power);

    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(window_size);
    let mut input = fft.make_input_vec();
    let mut output = fft.make_output_vec();

    let mut spectrogram = Spectrogram::new(rows, cols);

    for col in 0..cols {
        let start = col * step;
        for (i, value) in input.iter_mut().enumerate() {
            *value = samples[start + i] * window[i];
        }
        fft.process(&mut input, &mut output)?;

        for (row, bin) in output.iter().enumerate() {
            let mut power = bin.norm_sqr() * scale;
            // one-sided spectrum carries the mirrored bins' energy
            if row != 0 && row != rows - 1 {
                power *= 2.0;
            }
            let db = if power > 0.0 { 10.0 * power.log10() } else { 0.0 };
            spectrogram.set(row, col, db);
        }
    }

    Ok(spectrogram)
}

fn hann_window(size: usize) -> Vec<f64> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|n| {
            0.5 - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / (size - 1) as f64).cos()
        })
        .collect()
}

/// Pair every peak with the next `fan_value - 1` peaks in time order and emit
/// a hash for each pair within the configured time-delta bounds. Pairs that
/// touch the two lowest frequency bins are skipped, they carry mostly DC hum.
fn generate_hashes(
    mut skeleton: FingerPrint,
    mut peaks: Vec<Peak>,
    params: &FingerprintConfig,
) -> FingerPrint {
    peaks.sort_by_key(|&(freq, time)| (time, freq));

    for i in 0..peaks.len() {
        for j in 1..params.fan_value {
            let Some(&(freq2, t2)) = peaks.get(i + j) else {
                break;
            };
            let (freq1, t1) = peaks[i];

            if freq1 < 2 || freq2 < 2 {
                continue;
            }

            let t_delta = t2 as i64 - t1 as i64;
            if t_delta >= params.min_hash_time_delta && t_delta <= params.max_hash_time_delta {
                let hash = format!("{freq1}|{freq2}|{t_delta}");
                skeleton.add_pair(hash, (t1, freq1), (t2, freq2));
            }
        }
    }

    skeleton
}

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> FingerprintConfig {
        FingerprintConfig::default()
    }

    #[test]
    fn zero_window_has_no_hashes() {
        let amplitudes = vec![0i16; 8_000];
        let fingerprint =
            get_fingerprint("silence", &amplitudes, 8_000, &params()).expect("engine works");
        assert!(fingerprint.hashes_offsets.is_empty());
        assert!(fingerprint.first_points.is_empty());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let amplitudes: Vec<i16> = (0..16_000)
            .map(|i| {
                let t = i as f64 / 8_000.0;
                ((t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 8_000.0
                    + (t * 1_209.0 * 2.0 * std::f64::consts::PI).sin() * 4_000.0)
                    as i16
            })
            .collect();

        let a = get_fingerprint("a", &amplitudes, 8_000, &params()).expect("engine works");
        let b = get_fingerprint("b", &amplitudes, 8_000, &params()).expect("engine works");

        assert!(!a.is_empty());
        assert_eq!(a.hashes_offsets, b.hashes_offsets);
    }

    #[test]
    fn tone_peaks_land_on_the_tone_bin() {
        // 1 kHz tone at 8 kHz with a 160 point window: bin 1000 / 50 = 20
        let amplitudes: Vec<i16> = (0..16_000)
            .map(|i| {
                let t = i as f64 / 8_000.0;
                ((t * 1_000.0 * 2.0 * std::f64::consts::PI).sin() * 16_000.0) as i16
            })
            .collect();

        let fingerprint =
            get_fingerprint("tone", &amplitudes, 8_000, &params()).expect("engine works");
        assert!(!fingerprint.is_empty());
        assert!(
            fingerprint
                .first_points
                .values()
                .all(|&(_, freq)| (18..=22).contains(&freq)),
            "peaks of a pure tone should cluster on its frequency bin"
        );
    }

    #[test]
    fn hashes_encode_freqs_and_delta() {
        let spectrogram = Spectrogram::new(8, 8);
        let skeleton = FingerPrint::new("t".to_owned(), spectrogram);
        let peaks = vec![(4, 1), (6, 3), (1, 5)];
        let fingerprint = generate_hashes(skeleton, peaks, &params());

        // the (1, 5) peak sits below frequency bin 2 and is skipped
        assert_eq!(fingerprint.len(), 1);
        assert_eq!(fingerprint.hashes_offsets.get("4|6|2"), Some(&1));
        assert_eq!(fingerprint.first_points["4|6|2"], (1, 4));
        assert_eq!(fingerprint.second_points["4|6|2"], (3, 6));
    }

    #[test]
    fn spectrogram_shape_follows_window_and_overlap() {
        let samples = vec![0.0; 1_000];
        let spectrogram = compute_spectrogram(&samples, 8_000, 160, 0.55).expect("fft works");
        assert_eq!(spectrogram.rows(), 81);
        // step = 160 - 88 = 72 frames
        assert_eq!(spectrogram.cols(), (1_000 - 160) / 72 + 1);
    }
}
