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

//! The template library. Templates are WAV files (mono, PCM s16, at the
//! configured profile rate) loaded once at startup; the file stem is the
//! template name. Loading builds each template's fingerprint and a global
//! inverted index from hash string to the templates containing it. Both are
//! immutable afterwards and shared read-only.

use crate::{
    config::Config,
    error::{CallsonicError, CallsonicResult},
    fingerprint::{FingerPrint, get_fingerprint},
};
use hound::SampleFormat;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Leading samples up to the first amplitude above this are cut so the
/// fingerprint anchors on actual prompt audio instead of leader silence.
const TRIM_AMPLITUDE: i16 = 350;

#[derive(Debug, Clone)]
pub struct Template {
    pub template_id: usize,
    pub template_name: String,
    pub amplitudes: Vec<i16>,
    pub fingerprint: FingerPrint,
    /// Max amplitude per packet-sized block of the trimmed signal.
    pub max_amp_samples: Vec<i16>,
    pub count_samples: usize,
}

impl Template {
    pub fn new(
        template_id: usize,
        template_name: &str,
        mut amplitudes: Vec<i16>,
        block_size: usize,
        sample_rate: u32,
        config: &Config,
    ) -> CallsonicResult<Template> {
        trim_leading(&mut amplitudes);

        if amplitudes.is_empty() {
            return Err(CallsonicError::TemplateError(format!(
                "template {template_name} has no samples"
            )));
        }

        let fingerprint =
            get_fingerprint(template_name, &amplitudes, sample_rate, &config.fingerprint)?;

        let count_samples = amplitudes.len() / block_size.max(1);
        let max_amp_samples = amplitudes
            .chunks(block_size.max(1))
            .take(count_samples)
            .map(|block| block.iter().copied().max().unwrap_or(0))
            .collect();

        Ok(Template {
            template_id,
            template_name: template_name.to_owned(),
            amplitudes,
            fingerprint,
            max_amp_samples,
            count_samples,
        })
    }
}

fn trim_leading(amplitudes: &mut Vec<i16>) {
    match amplitudes.iter().position(|amp| *amp > TRIM_AMPLITUDE) {
        Some(first_loud) => {
            amplitudes.drain(..first_loud);
        }
        None => {
            // nothing above the floor, keep the tail sample like a
            // fully-drained trim would
            if amplitudes.len() > 1 {
                amplitudes.drain(..amplitudes.len() - 1);
            }
        }
    }
}

pub struct TemplateLibrary {
    pub templates: HashMap<String, Template>,
    pub hash_index: HashMap<String, Vec<String>>,
}

impl TemplateLibrary {
    pub fn empty() -> TemplateLibrary {
        TemplateLibrary {
            templates: HashMap::new(),
            hash_index: HashMap::new(),
        }
    }

    #[instrument(skip(config))]
    pub fn load(folder: &Path, config: &Config) -> CallsonicResult<TemplateLibrary> {
        let sample_rate = config.detection.sample_rate;
        // one packet of the profile is 20 ms of audio
        let block_size = (sample_rate / 50) as usize;

        let mut files: Vec<PathBuf> = fs::read_dir(folder)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "wav"))
            .collect();
        files.sort();

        let mut library = TemplateLibrary::empty();

        for (template_id, path) in files.iter().enumerate() {
            let Some(template_name) = path.file_stem().map(|it| it.to_string_lossy().to_string())
            else {
                continue;
            };

            let amplitudes = match read_template_wav(path, sample_rate) {
                Ok(it) => it,
                Err(e) => {
                    warn!("skipping template {template_name}: {e}");
                    continue;
                }
            };

            match Template::new(
                template_id,
                &template_name,
                amplitudes,
                block_size,
                sample_rate,
                config,
            ) {
                Ok(template) => library.insert(template),
                Err(e) => warn!("skipping template {template_name}: {e}"),
            }
        }

        info!(
            "loaded {} templates with {} distinct hashes",
            library.templates.len(),
            library.hash_index.len()
        );

        Ok(library)
    }

    pub(crate) fn insert(&mut self, template: Template) {
        for hash in template.fingerprint.hashes_offsets.keys() {
            let names = self.hash_index.entry(hash.clone()).or_default();
            if !names.contains(&template.template_name) {
                names.push(template.template_name.clone());
            }
        }
        self.templates
            .insert(template.template_name.clone(), template);
    }
}

fn read_template_wav(path: &Path, expected_sample_rate: u32) -> CallsonicResult<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.sample_rate != expected_sample_rate {
        return Err(CallsonicError::TemplateError(format!(
            "sample rate {} does not match profile {expected_sample_rate}",
            spec.sample_rate
        )));
    }
    if spec.channels != 1 {
        return Err(CallsonicError::TemplateError(format!(
            "{} channels, only mono is supported",
            spec.channels
        )));
    }
    if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        return Err(CallsonicError::TemplateError(
            "only PCM s16 is supported".to_owned(),
        ));
    }

    let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    Ok(samples?)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tone(len: usize, freq: f64, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / 8_000.0;
                ((t * freq * 2.0 * std::f64::consts::PI).sin() * amplitude) as i16
            })
            .collect()
    }

    #[test]
    fn leading_silence_is_trimmed() {
        let mut amplitudes = vec![0, 10, 120, 500, 600, 100];
        trim_leading(&mut amplitudes);
        assert_eq!(amplitudes, vec![500, 600, 100]);
    }

    #[test]
    fn all_quiet_template_keeps_one_sample() {
        let mut amplitudes = vec![0, 10, 20];
        trim_leading(&mut amplitudes);
        assert_eq!(amplitudes, vec![20]);
    }

    #[test]
    fn template_builds_block_maxima() {
        let config = Config::default();
        let mut amplitudes = tone(8_000, 1_000.0, 12_000.0);
        // make sure the first sample survives trimming
        amplitudes[0] = 12_000;
        let template =
            Template::new(0, "greeting", amplitudes, 160, 8_000, &config).expect("valid template");

        assert_eq!(template.count_samples, template.max_amp_samples.len());
        assert_eq!(template.count_samples, template.amplitudes.len() / 160);
        assert!(template.max_amp_samples.iter().all(|max| *max > 10_000));
        assert!(!template.fingerprint.is_empty());
    }

    #[test]
    fn library_loads_wav_folder_and_indexes_hashes() {
        let dir = std::env::temp_dir().join(format!("callsonic-templates-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("temp dir");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer =
            hound::WavWriter::create(dir.join("beep.wav"), spec).expect("wav writer");
        for amp in tone(8_000, 950.0, 14_000.0) {
            writer.write_sample(amp).expect("write sample");
        }
        writer.finalize().expect("finalize");

        // wrong rate, must be skipped
        let bad_spec = hound::WavSpec {
            sample_rate: 44_100,
            ..spec
        };
        let mut bad =
            hound::WavWriter::create(dir.join("music.wav"), bad_spec).expect("wav writer");
        bad.write_sample(0i16).expect("write sample");
        bad.finalize().expect("finalize");

        let config = Config::default();
        let library = TemplateLibrary::load(&dir, &config).expect("library loads");

        assert_eq!(library.templates.len(), 1);
        assert!(library.templates.contains_key("beep"));
        assert!(!library.hash_index.is_empty());
        assert!(
            library
                .hash_index
                .values()
                .all(|names| names == &vec!["beep".to_owned()])
        );

        fs::remove_dir_all(&dir).ok();
    }
}
