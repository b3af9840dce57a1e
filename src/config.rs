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

use crate::error::CallsonicResult;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "CALLSONIC_CONFIG")]
    config: Option<PathBuf>,
}

/// Fingerprint engine tuning. The defaults are the 8 kHz telephony profile;
/// `window_size` falls back to 160 at 8 kHz and 512 at 16 kHz when unset.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub window_size: Option<usize>,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
    #[serde(default = "default_fan_value")]
    pub fan_value: usize,
    #[serde(default = "default_amp_min")]
    pub amp_min: f64,
    #[serde(default = "default_peak_neighborhood_size")]
    pub peak_neighborhood_size: usize,
    #[serde(default = "default_min_hash_time_delta")]
    pub min_hash_time_delta: i64,
    #[serde(default = "default_max_hash_time_delta")]
    pub max_hash_time_delta: i64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            window_size: None,
            overlap_ratio: default_overlap_ratio(),
            fan_value: default_fan_value(),
            amp_min: default_amp_min(),
            peak_neighborhood_size: default_peak_neighborhood_size(),
            min_hash_time_delta: default_min_hash_time_delta(),
            max_hash_time_delta: default_max_hash_time_delta(),
        }
    }
}

impl FingerprintConfig {
    pub fn window_size(&self, sample_rate: u32) -> usize {
        match self.window_size {
            Some(it) => it,
            None if sample_rate >= 16_000 => 512,
            None => 160,
        }
    }
}

fn default_overlap_ratio() -> f64 {
    0.55
}

fn default_fan_value() -> usize {
    15
}

fn default_amp_min() -> f64 {
    10.0
}

fn default_peak_neighborhood_size() -> usize {
    6
}

fn default_min_hash_time_delta() -> i64 {
    0
}

fn default_max_hash_time_delta() -> i64 {
    200
}

/// Amplitude thresholds and the stream profile the acoustic-event
/// classification runs against.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_sample_width")]
    pub sample_width: u16,
    #[serde(default = "default_amp_beep")]
    pub amp_beep: i32,
    #[serde(default = "default_amp_voice")]
    pub amp_voice: i32,
    #[serde(default = "default_amp_noise")]
    pub amp_noise: i32,
    #[serde(default = "default_min_amplitude_for_detection")]
    pub min_amplitude_for_detection: i32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            sample_width: default_sample_width(),
            amp_beep: default_amp_beep(),
            amp_voice: default_amp_voice(),
            amp_noise: default_amp_noise(),
            min_amplitude_for_detection: default_min_amplitude_for_detection(),
        }
    }
}

fn default_sample_rate() -> u32 {
    8_000
}

fn default_sample_width() -> u16 {
    2
}

fn default_amp_beep() -> i32 {
    2_000
}

fn default_amp_voice() -> i32 {
    250
}

fn default_amp_noise() -> i32 {
    100
}

fn default_min_amplitude_for_detection() -> i32 {
    2_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_api_host")]
    pub app_api_host: String,
    #[serde(default = "default_api_port")]
    pub app_api_port: u16,
    #[serde(default = "default_timeout_keep_alive")]
    pub timeout_keep_alive: u64,
    #[serde(default = "default_true")]
    pub alive: bool,
    #[serde(default)]
    pub wait_shutdown: bool,
    #[serde(default = "default_true")]
    pub console_log: bool,
    #[serde(default = "default_unicast_host")]
    pub app_unicast_host: String,
    #[serde(default = "default_unicast_port")]
    pub app_unicast_port: u16,
    #[serde(default = "default_unicast_protocol")]
    pub app_unicast_protocol: String,
    #[serde(default = "default_unicast_buffer_size")]
    pub app_unicast_buffer_size: usize,
    #[serde(default)]
    pub save_png_match_detection: bool,
    #[serde(default = "default_template_folder_path")]
    pub template_folder_path: String,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_api_host: default_api_host(),
            app_api_port: default_api_port(),
            timeout_keep_alive: default_timeout_keep_alive(),
            alive: true,
            wait_shutdown: false,
            console_log: true,
            app_unicast_host: default_unicast_host(),
            app_unicast_port: default_unicast_port(),
            app_unicast_protocol: default_unicast_protocol(),
            app_unicast_buffer_size: default_unicast_buffer_size(),
            save_png_match_detection: false,
            template_folder_path: default_template_folder_path(),
            fingerprint: FingerprintConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

fn default_app_name() -> String {
    "callsonic".to_owned()
}

fn default_api_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_api_port() -> u16 {
    7005
}

fn default_timeout_keep_alive() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_unicast_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_unicast_port() -> u16 {
    1234
}

fn default_unicast_protocol() -> String {
    "udp".to_owned()
}

fn default_unicast_buffer_size() -> usize {
    1024
}

fn default_template_folder_path() -> String {
    "templates".to_owned()
}

impl Config {
    #[instrument]
    pub async fn load() -> CallsonicResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref()).await?;

        Ok(config)
    }

    #[instrument]
    pub async fn load_from_file(path: Option<&Path>) -> CallsonicResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_json::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.json";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/callsonic/config.json";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_json::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    /// Seconds of audio carried by one RTP packet of `payload_length` bytes.
    pub fn duration_one_sample(&self, payload_length: usize) -> f64 {
        payload_length as f64 / self.detection.sample_width as f64 / self.detection.sample_rate as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "app_unicast_port": 40000 }"#).expect("valid json");
        assert_eq!(config.app_unicast_port, 40000);
        assert_eq!(config.app_name, "callsonic");
        assert_eq!(config.app_api_port, 7005);
        assert!(config.alive);
        assert!(!config.wait_shutdown);
        assert_eq!(config.detection.amp_beep, 2_000);
        assert_eq!(config.fingerprint.fan_value, 15);
    }

    #[test]
    fn window_size_follows_profile() {
        let fp = FingerprintConfig::default();
        assert_eq!(fp.window_size(8_000), 160);
        assert_eq!(fp.window_size(16_000), 512);
        let fixed = FingerprintConfig {
            window_size: Some(256),
            ..FingerprintConfig::default()
        };
        assert_eq!(fixed.window_size(8_000), 256);
    }

    #[test]
    fn packet_duration_uses_profile() {
        let config = Config::default();
        // 320 payload bytes at s16/8 kHz are 20 ms of audio
        assert!((config.duration_one_sample(320) - 0.02).abs() < f64::EPSILON);
    }
}
