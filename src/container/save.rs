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

//! Recording sink. Flushes a container's little-endian byte timeline into a
//! single-channel WAV file under `records/YYYY/MM/DD/HH/`. Runs on the
//! blocking pool, never inside the cooperative runtime.

use crate::error::CallsonicResult;
use chrono::{Datelike, Local, Timelike};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::{collections::BTreeMap, fs, path::PathBuf};

const RECORDS_FOLDER: &str = "records";

pub fn save_wav_file(
    file_name: &str,
    save_format: &str,
    bytes_samples: BTreeMap<i64, Vec<u8>>,
    sample_width: u16,
    sample_rate: u32,
) -> CallsonicResult<PathBuf> {
    let path = path_for_save_file(RECORDS_FOLDER, file_name, save_format)?;
    write_wav(&path, bytes_samples, sample_width, sample_rate)?;
    Ok(path)
}

pub fn path_for_save_file(
    folder: &str,
    file_name: &str,
    save_format: &str,
) -> CallsonicResult<PathBuf> {
    let now = Local::now();
    let mut path = PathBuf::from(folder);
    path.push(now.year().to_string());
    path.push(format!("{:02}", now.month()));
    path.push(format!("{:02}", now.day()));
    path.push(format!("{:02}", now.hour()));
    fs::create_dir_all(&path)?;

    let stem = file_name.trim_end_matches(".wav");
    path.push(format!("{stem}.{save_format}"));
    Ok(path)
}

fn write_wav(
    path: &PathBuf,
    bytes_samples: BTreeMap<i64, Vec<u8>>,
    sample_width: u16,
    sample_rate: u32,
) -> CallsonicResult<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: sample_width * 8,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for bytes in bytes_samples.values() {
        for chunk in bytes.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
        }
    }
    writer.finalize()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_ordered_mono_wav() {
        let dir = std::env::temp_dir().join(format!("callsonic-records-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("chan-1.wav");

        let mut bytes_samples = BTreeMap::new();
        bytes_samples.insert(2i64, vec![0x03, 0x00, 0x04, 0x00]);
        bytes_samples.insert(1i64, vec![0x01, 0x00, 0x02, 0x00]);
        write_wav(&path, bytes_samples, 2, 8_000).expect("wav written");

        let mut reader = hound::WavReader::open(&path).expect("wav opens");
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 8_000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn save_path_contains_date_tree_and_format() {
        let dir = std::env::temp_dir().join(format!("callsonic-paths-{}", std::process::id()));
        let path = path_for_save_file(dir.to_str().expect("utf8 path"), "chan-1.wav", "wav")
            .expect("path built");

        // records/<year>/<month>/<day>/<hour>/chan-1.wav, without a doubled
        // .wav from the original file name
        assert_eq!(
            path.file_name().map(|it| it.to_string_lossy().to_string()),
            Some("chan-1.wav".to_owned())
        );
        assert_eq!(path.strip_prefix(&dir).expect("under folder").components().count(), 5);
        fs::remove_dir_all(&dir).ok();
    }
}
