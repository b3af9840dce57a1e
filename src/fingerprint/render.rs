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

//! Diagnostic rendering of a match: the spectrogram as a heat map, the
//! matching peak pairs as green markers and the temporal shift as a red
//! vertical line. Purely best-effort, a failed render never affects
//! detection.

use crate::{error::CallsonicResult, fingerprint::FingerPrint};
use chrono::{Datelike, Local, Timelike};
use image::{Rgb, RgbImage};
use std::{collections::HashSet, fs, path::PathBuf};
use tracing::info;

pub fn save_matching_print(
    fingerprint: &FingerPrint,
    matching_hashes: &[String],
    save_folder: &str,
    print_name: &str,
    shift: i64,
) -> CallsonicResult<()> {
    let mut matching_points: HashSet<(usize, usize)> = HashSet::new();
    for hash in matching_hashes {
        if let Some(point) = fingerprint.first_points.get(hash) {
            matching_points.insert(*point);
        }
        if let Some(point) = fingerprint.second_points.get(hash) {
            matching_points.insert(*point);
        }
    }

    if matching_points.is_empty() {
        return Ok(());
    }

    let path = target_path(save_folder, print_name)?;
    let image = render(fingerprint, &matching_points, shift);
    image.save(&path)?;
    info!("saved match rendering to {}", path.to_string_lossy());

    Ok(())
}

fn target_path(save_folder: &str, print_name: &str) -> CallsonicResult<PathBuf> {
    let now = Local::now();
    let mut path = PathBuf::from(save_folder);
    path.push(now.year().to_string());
    path.push(format!("{:02}", now.month()));
    path.push(format!("{:02}", now.day()));
    path.push(format!("{:02}", now.hour()));
    fs::create_dir_all(&path)?;
    path.push(format!("{print_name}.png"));
    Ok(path)
}

fn render(
    fingerprint: &FingerPrint,
    matching_points: &HashSet<(usize, usize)>,
    shift: i64,
) -> RgbImage {
    let spectrogram = &fingerprint.spectrogram;
    let width = spectrogram.cols().max(1) as u32;
    let height = spectrogram.rows().max(1) as u32;
    let mut image = RgbImage::new(width, height);

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for row in 0..spectrogram.rows() {
        for col in 0..spectrogram.cols() {
            let value = spectrogram.at(row, col);
            min = min.min(value);
            max = max.max(value);
        }
    }
    let span = if max > min { max - min } else { 1.0 };

    for row in 0..spectrogram.rows() {
        for col in 0..spectrogram.cols() {
            let normalized = (spectrogram.at(row, col) - min) / span;
            // low frequencies at the bottom of the image
            let y = height - 1 - row as u32;
            image.put_pixel(col as u32, y, heat_color(normalized));
        }
    }

    if shift >= 0 && (shift as u32) < width {
        for y in 0..height {
            image.put_pixel(shift as u32, y, Rgb([220, 40, 40]));
        }
    }

    for &(time, freq) in matching_points {
        mark(&mut image, time as i64, (height as i64 - 1) - freq as i64);
    }

    image
}

fn mark(image: &mut RgbImage, x: i64, y: i64) {
    for dx in -1..=1 {
        for dy in -1..=1 {
            let px = x + dx;
            let py = y + dy;
            if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
                image.put_pixel(px as u32, py as u32, Rgb([40, 200, 60]));
            }
        }
    }
}

fn heat_color(normalized: f64) -> Rgb<u8> {
    let v = normalized.clamp(0.0, 1.0);
    let r = (255.0 * v) as u8;
    let g = (160.0 * v * v) as u8;
    let b = (96.0 * (1.0 - v)) as u8;
    Rgb([r, g, b])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fingerprint::Spectrogram;
    use std::collections::HashSet;

    #[test]
    fn renders_matching_points_and_shift() {
        let mut spectrogram = Spectrogram::new(4, 8);
        spectrogram.set(2, 3, 40.0);
        let fingerprint = FingerPrint {
            print_name: "t".to_owned(),
            spectrogram,
            hashes_offsets: Default::default(),
            first_points: Default::default(),
            second_points: Default::default(),
        };

        let mut points = HashSet::new();
        points.insert((3usize, 2usize));
        let image = render(&fingerprint, &points, 1);

        assert_eq!(image.dimensions(), (8, 4));
        assert_eq!(image.get_pixel(1, 0), &Rgb([220, 40, 40]));
        assert_eq!(image.get_pixel(3, 1), &Rgb([40, 200, 60]));
    }
}
