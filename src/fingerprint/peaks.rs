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

//! 2-D local-maximum extraction on a spectrogram. The neighborhood is a
//! diamond: a single-connectivity cross structure dilated onto itself
//! `neighborhood_size` times. A cell is a peak iff the dilated image equals
//! the original there and the value clears the amplitude floor.

use crate::fingerprint::{Peak, Spectrogram};

pub fn get_2d_peaks(
    spectrogram: &Spectrogram,
    neighborhood_size: usize,
    amp_min: f64,
) -> Vec<Peak> {
    if spectrogram.rows() == 0 || spectrogram.cols() == 0 {
        return Vec::new();
    }

    let dilated = dilate(spectrogram, neighborhood_size);

    let mut peaks = Vec::new();
    for row in 0..spectrogram.rows() {
        for col in 0..spectrogram.cols() {
            let value = spectrogram.at(row, col);
            if value > amp_min && dilated.at(row, col) == value {
                peaks.push((row, col));
            }
        }
    }

    peaks
}

/// Grayscale dilation by a diamond of the given radius, computed as repeated
/// dilation with the 4-connected cross.
fn dilate(spectrogram: &Spectrogram, iterations: usize) -> Spectrogram {
    let rows = spectrogram.rows();
    let cols = spectrogram.cols();

    let mut current = spectrogram.clone();
    let mut next = Spectrogram::new(rows, cols);

    for _ in 0..iterations {
        for row in 0..rows {
            for col in 0..cols {
                let mut max = current.at(row, col);
                if row > 0 {
                    max = max.max(current.at(row - 1, col));
                }
                if row + 1 < rows {
                    max = max.max(current.at(row + 1, col));
                }
                if col > 0 {
                    max = max.max(current.at(row, col - 1));
                }
                if col + 1 < cols {
                    max = max.max(current.at(row, col + 1));
                }
                next.set(row, col, max);
            }
        }
        std::mem::swap(&mut current, &mut next);
    }

    current
}
