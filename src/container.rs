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

//! Per-call audio container. Owns the reassembled PCM timeline of one RTP
//! flow: sequence-number wrap handling, loss repair, rolling amplitude
//! statistics, the acoustic-event markers and the admission state for the
//! detector. A container is created by the CREATE event, activated by the
//! first RTP packet and keeps a parse task ticking until its deadlines run
//! out, after which the recording is flushed.

pub mod markers;
pub mod save;

use crate::{
    client::CallbackClient,
    config::Config,
    events::{Event, EventCreate, EventDetect, parse_event_time},
    packet::Packet,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Sentinel for "not yet observed".
pub const CODE_AWAIT: i64 = -1;
/// Sentinel for "searched and ruled out".
pub const CODE_NOT_FOUND: i64 = 0;

/// The 16-bit RTP sequence space; crossing zero bumps the reset counter.
pub const WRAP_PERIOD: i64 = 65535;

/// Packets parsed from the pending queue per tick.
const PARSE_BATCH: usize = 400;

pub struct AudioContainer {
    pub chan_id: String,
    pub call_id: String,
    pub em_host: String,
    pub em_port: u16,
    pub event_create: EventCreate,
    pub config: Arc<Config>,
    pub callback: Arc<CallbackClient>,
    alive: Arc<AtomicBool>,
    parse_started: AtomicBool,
    ident: String,
    state: Mutex<ContainerState>,
}

pub struct ContainerState {
    pub em_ssrc: i64,

    pub event_progress: Option<Event>,
    pub event_answer: Option<Event>,
    pub events_detect: Vec<EventDetect>,
    pub event_destroy: Option<Event>,

    pub packages_for_analyse: Vec<Packet>,
    pub analyzed_samples: BTreeMap<i64, Vec<i16>>,
    pub bytes_samples: BTreeMap<i64, Vec<u8>>,
    pub max_amplitude_samples: BTreeMap<i64, i16>,
    pub min_amplitude_samples: BTreeMap<i64, i16>,

    pub detect_until_time: DateTime<Utc>,
    pub break_while_time: DateTime<Utc>,
    pub time_add_first_package: Option<DateTime<Utc>>,
    pub time_add_last_package: Option<DateTime<Utc>>,

    pub duration_stream: f64,
    pub duration_check_detect: f64,
    pub number_resets_sequence: i64,
    pub payload_length: i64,
    pub seq_num_first_package: i64,
    pub seq_num_last_package: i64,

    pub seq_num_answer_package: i64,
    pub seq_num_first_beep: i64,
    pub seq_num_noise_after_answer: i64,
    pub seq_num_voice_before_answer: i64,
    pub amp_adc_noise: i64,
    pub found_first_noise: u8,

    pub last_detect_seq_num: i64,
    pub found_templates: String,
    pub lost_packets: u64,
}

impl ContainerState {
    fn new() -> ContainerState {
        let now = Utc::now();
        ContainerState {
            em_ssrc: CODE_AWAIT,
            event_progress: None,
            event_answer: None,
            events_detect: Vec::new(),
            event_destroy: None,
            packages_for_analyse: Vec::new(),
            analyzed_samples: BTreeMap::new(),
            bytes_samples: BTreeMap::new(),
            max_amplitude_samples: BTreeMap::new(),
            min_amplitude_samples: BTreeMap::new(),
            detect_until_time: now + ChronoDuration::minutes(2),
            break_while_time: now + ChronoDuration::minutes(90),
            time_add_first_package: None,
            time_add_last_package: None,
            duration_stream: 0.0,
            duration_check_detect: 0.0,
            number_resets_sequence: 0,
            payload_length: CODE_AWAIT,
            seq_num_first_package: CODE_AWAIT,
            seq_num_last_package: CODE_AWAIT,
            seq_num_answer_package: CODE_AWAIT,
            seq_num_first_beep: CODE_AWAIT,
            seq_num_noise_after_answer: CODE_AWAIT,
            seq_num_voice_before_answer: CODE_AWAIT,
            amp_adc_noise: CODE_AWAIT,
            found_first_noise: 0,
            last_detect_seq_num: 0,
            found_templates: String::new(),
            lost_packets: 0,
        }
    }
}

impl AudioContainer {
    pub fn new(
        config: Arc<Config>,
        alive: Arc<AtomicBool>,
        event_create: EventCreate,
        callback: Arc<CallbackClient>,
    ) -> AudioContainer {
        let chan_id = event_create.event.chan_id.clone();
        let call_id = event_create.event.call_id.clone();
        let em_host = event_create.info.em_host.clone();
        let em_port = event_create.info.em_port;
        let ident = format!("{chan_id}@{em_host}:{em_port}");

        info!("[{ident}] init audio container call_id={call_id}");

        AudioContainer {
            chan_id,
            call_id,
            em_host,
            em_port,
            event_create,
            config,
            callback,
            alive,
            parse_started: AtomicBool::new(false),
            ident,
            state: Mutex::new(ContainerState::new()),
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn sample_width(&self) -> u16 {
        self.event_create.info.em_sample_width
    }

    pub fn sample_rate(&self) -> u32 {
        self.event_create.info.em_sample_rate
    }

    /// Seconds of audio in one packet; constant once the first packet fixed
    /// the payload length.
    pub fn duration_one_sample(&self, payload_length: i64) -> f64 {
        payload_length as f64 / self.sample_width() as f64 / self.sample_rate() as f64
    }

    /// Record an incoming packet. Returns `true` if it was the first one and
    /// the caller should spawn the parse task.
    pub fn append_package_for_analyse(&self, package: Packet) -> bool {
        let mut state = self.state.lock();
        state.time_add_last_package = Some(Utc::now());

        if state.seq_num_first_package == CODE_AWAIT {
            info!("[{}] add first package: {}", self.ident, package.seq_num);
            state.seq_num_first_package = package.seq_num as i64;
            state.seq_num_last_package = package.seq_num as i64;
            state.payload_length = package.payload.len() as i64;
            state.em_ssrc = package.ssrc as i64;
            state.time_add_first_package = Some(Utc::now());
            state.packages_for_analyse.push(package);
            drop(state);
            return !self.parse_started.swap(true, Ordering::SeqCst);
        }

        state.packages_for_analyse.push(package);
        false
    }

    pub fn add_event_progress(&self, event: Event) {
        self.state.lock().event_progress = Some(event);
    }

    pub fn add_event_answer(&self, event: Event) {
        let mut state = self.state.lock();
        let now = Utc::now();
        if now < state.detect_until_time {
            state.detect_until_time = now + ChronoDuration::seconds(15);
        }
        state.event_answer = Some(event);
        drop(state);
        self.compute_answer_seq_num();
    }

    pub fn add_event_detect(&self, event: EventDetect) {
        let mut state = self.state.lock();
        let now = Utc::now();
        if now < state.detect_until_time {
            state.detect_until_time = now;
        }
        state.events_detect.push(event);
    }

    pub fn add_event_destroy(&self, event: Event) {
        let mut state = self.state.lock();
        state.event_destroy = Some(event);
        state.break_while_time = Utc::now() + ChronoDuration::seconds(5);
    }

    /// First writer wins; returns whether this call recorded the match.
    pub fn add_found_template(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        if !state.found_templates.is_empty() {
            return false;
        }
        info!("[{}] found template with name={name}", self.ident);
        state.detect_until_time = Utc::now();
        state.found_templates = name.to_owned();
        true
    }

    pub fn add_detect_duration(&self, seconds: f64) {
        self.state.lock().duration_check_detect += seconds;
    }

    pub fn found_templates(&self) -> String {
        self.state.lock().found_templates.clone()
    }

    /// First and last corrected sequence numbers seen so far.
    pub fn seq_bounds(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.seq_num_first_package, state.seq_num_last_package)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().event_destroy.is_some()
    }

    pub fn packets_received(&self) -> usize {
        let state = self.state.lock();
        state.analyzed_samples.len() + state.packages_for_analyse.len()
            - state.lost_packets as usize
    }

    /// The ANSWER marker in sequence-number space. Derived from the
    /// CREATE→ANSWER wall-clock delta once both the event and the first
    /// packet are known; sentinels never enter the arithmetic.
    fn compute_answer_seq_num(&self) {
        let mut state = self.state.lock();
        if state.seq_num_answer_package != CODE_AWAIT
            || state.event_answer.is_none()
            || state.seq_num_first_package == CODE_AWAIT
            || state.payload_length == CODE_AWAIT
        {
            return;
        }

        let answer_time = state
            .event_answer
            .as_ref()
            .map(|it| it.event_time.clone())
            .unwrap_or_default();

        let create = parse_event_time(&self.event_create.event.event_time);
        let answer = parse_event_time(&answer_time);
        let (create, answer) = match (create, answer) {
            (Ok(create), Ok(answer)) => (create, answer),
            _ => {
                warn!("[{}] unparseable event times, answer marker lost", self.ident);
                state.seq_num_answer_package = CODE_NOT_FOUND;
                return;
            }
        };

        let duration_before_answer =
            (answer - create).num_milliseconds() as f64 / 1_000.0;
        let samples_before_answer =
            duration_before_answer / self.duration_one_sample(state.payload_length);
        state.seq_num_answer_package =
            state.seq_num_first_package + samples_before_answer.floor() as i64;
        info!(
            "[{}] answer package seq_num={}",
            self.ident, state.seq_num_answer_package
        );
    }

    /// The parse task: ticks until the deadlines run out, each tick builds
    /// the timeline from the pending queue and advances the acoustic
    /// markers, then the recording is flushed.
    pub async fn run_parse_loop(self: Arc<Self>) {
        info!("[{}] begin start_parse", self.ident);

        loop {
            if !self.alive.load(Ordering::Relaxed) {
                break;
            }
            {
                let state = self.state.lock();
                if Utc::now() >= state.break_while_time {
                    break;
                }
            }

            let answered = self.state.lock().event_answer.is_some();
            if answered {
                sleep(Duration::from_millis(200)).await;
            } else {
                sleep(Duration::from_millis(500)).await;
            }

            self.check_end();
            self.fast_build();
            self.compute_answer_seq_num();
            self.run_marker_searches();
        }

        info!("[{}] end start_parse", self.ident);
        self.start_save().await;
    }

    fn run_marker_searches(&self) {
        let mut state = self.state.lock();
        let detection = &self.config.detection;

        markers::find_first_noise(&mut state, detection, &self.ident);

        if state.seq_num_first_beep == CODE_AWAIT {
            markers::find_seq_num_first_beep(&mut state, detection, &self.ident);
            markers::find_amp_adc_noise(&mut state, detection, &self.ident);
        }

        if state.event_answer.is_some() {
            markers::find_seq_num_noise_after_answer(&mut state, detection, &self.ident);
        } else {
            markers::find_seq_num_voice_before_answer(&mut state, detection, &self.ident);
        }
    }

    /// Tighten the hard deadline when the stream went silent without a
    /// DESTROY event.
    fn check_end(&self) {
        let mut state = self.state.lock();
        if Utc::now() > state.break_while_time {
            return;
        }

        if let Some(last) = state.time_add_last_package {
            if (Utc::now() - last).num_seconds() > 30 {
                state.break_while_time = last + ChronoDuration::seconds(30);
                error!(
                    "[{}] new packages are not received and event_destroy not found",
                    self.ident
                );
            }
        }
    }

    fn fast_build(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;

        let take = state.packages_for_analyse.len().min(PARSE_BATCH);
        let parse_packages: Vec<Packet> = state.packages_for_analyse.drain(..take).collect();

        for package in &parse_packages {
            let mut fix_seq_num = package.seq_num as i64;

            // crossing the 16-bit boundary; raw numbers restart near zero
            // while the corrected cursor keeps growing
            if state.seq_num_last_package - fix_seq_num > WRAP_PERIOD - 1000 {
                if fix_seq_num < 1000 {
                    state.number_resets_sequence =
                        (state.seq_num_last_package as f64 / WRAP_PERIOD as f64).round() as i64;
                }
                fix_seq_num += state.number_resets_sequence * WRAP_PERIOD;
            }

            if state.seq_num_last_package < fix_seq_num {
                state.seq_num_last_package = fix_seq_num;
            }

            state
                .analyzed_samples
                .insert(fix_seq_num, package.amplitudes.clone());
            state
                .bytes_samples
                .insert(fix_seq_num, package.wav_bytes.clone());
            state
                .max_amplitude_samples
                .insert(fix_seq_num, package.max_amplitude);
            state
                .min_amplitude_samples
                .insert(fix_seq_num, package.min_amplitude);
        }

        state.duration_stream =
            state.analyzed_samples.len() as f64 * self.duration_one_sample(state.payload_length);

        if Utc::now() < state.detect_until_time && parse_packages.len() > 50 {
            warn!(
                "[{}] find delay!!! count parse_packages={}",
                self.ident,
                parse_packages.len()
            );
        }

        let expected = state.seq_num_last_package - state.seq_num_first_package + 1;
        if state.analyzed_samples.len() as i64 == expected {
            return;
        }

        let filler = state
            .analyzed_samples
            .get(&state.seq_num_first_package)
            .cloned()
            .unwrap_or_default();

        let mut lost_sequences = Vec::new();
        for seq_num in state.seq_num_first_package..state.seq_num_last_package {
            if !state.analyzed_samples.contains_key(&seq_num) {
                lost_sequences.push(seq_num);
                state.analyzed_samples.insert(seq_num, filler.clone());
                state.max_amplitude_samples.insert(seq_num, 0);
                state.min_amplitude_samples.insert(seq_num, 0);
            }
        }

        if let (Some(first), Some(last)) = (lost_sequences.first(), lost_sequences.last()) {
            state.lost_packets += lost_sequences.len() as u64;
            error!(
                "[{}] lost from {first} to {last}, count={}",
                self.ident,
                lost_sequences.len()
            );
        }
    }

    /// Detector admission: checks all gates, snapshots the most recent
    /// window and stamps `last_detect_seq_num`. Windows below the silence
    /// floor are stamped but not admitted.
    pub fn admit_window(&self, window_packets: usize, min_amplitude: i16) -> Option<Vec<i16>> {
        let mut state = self.state.lock();

        if state.event_destroy.is_some()
            || !state.found_templates.is_empty()
            || state.found_first_noise == 0
            || state.duration_stream < 2.0
            || Utc::now() > state.detect_until_time
            || state.seq_num_last_package == state.last_detect_seq_num
        {
            return None;
        }

        state.last_detect_seq_num = state.seq_num_last_package;

        let window: Vec<i16> = state
            .analyzed_samples
            .iter()
            .rev()
            .take(window_packets)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .flat_map(|(_, amplitudes)| amplitudes.iter().copied())
            .collect();

        if window.iter().copied().max().unwrap_or(0) < min_amplitude {
            return None;
        }

        Some(window)
    }

    async fn start_save(&self) {
        let summary = {
            let state = self.state.lock();
            serde_json::json!({
                "seq_num_first_package": state.seq_num_first_package,
                "seq_num_first_beep": state.seq_num_first_beep,
                "seq_num_noise_after_answer": state.seq_num_noise_after_answer,
                "seq_num_answer_package": state.seq_num_answer_package,
                "seq_num_voice_before_answer": state.seq_num_voice_before_answer,
                "seq_num_last_package": state.seq_num_last_package,
                "found_first_noise": state.found_first_noise,
                "found_templates": state.found_templates,
                "sample_rate": self.sample_rate(),
                "sample_width": self.sample_width(),
                "amp_adc_noise": state.amp_adc_noise,
                "len_parse_packs": state.max_amplitude_samples.len(),
                "len_raw_packs": state.packages_for_analyse.len(),
                "lost_packets": state.lost_packets,
                "duration_check_detect": state.duration_check_detect,
            })
        };
        info!("[{}] info: {summary}", self.ident);

        let (raw_packs, last_seq, bytes_samples) = {
            let state = self.state.lock();
            (
                state.packages_for_analyse.len(),
                state.seq_num_last_package,
                state.bytes_samples.clone(),
            )
        };

        if raw_packs > 0 {
            error!("[{}] found raw packs, count: {raw_packs}", self.ident);
        }
        if last_seq == CODE_AWAIT {
            warn!("[{}] not found packs", self.ident);
        }

        if self.event_create.info.save_record == 1 {
            let file_name = self.chan_id.clone();
            let save_format = self.event_create.info.save_format.clone();
            let sample_width = self.sample_width();
            let sample_rate = self.sample_rate();
            let ident = self.ident.clone();

            let save = tokio::task::spawn_blocking(move || {
                save::save_wav_file(
                    &file_name,
                    &save_format,
                    bytes_samples,
                    sample_width,
                    sample_rate,
                )
            });
            match save.await {
                Ok(Ok(path)) => info!("[{ident}] saved record: {}", path.to_string_lossy()),
                Ok(Err(e)) => error!("[{ident}] saving record failed: {e}"),
                Err(e) => error!("[{ident}] save task failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{envelope, rtp_packet, test_container};
    use serde_json::json;

    fn container() -> AudioContainer {
        test_container()
    }

    fn packet(seq_num: u16, amplitudes: &[i16]) -> Packet {
        rtp_packet(seq_num, 4000, amplitudes)
    }

    #[test]
    fn first_packet_fixes_cursors() {
        let container = container();
        let first = container.append_package_for_analyse(packet(100, &[1, 2]));
        assert!(first);
        let second = container.append_package_for_analyse(packet(101, &[3, 4]));
        assert!(!second);

        let state = container.state.lock();
        assert_eq!(state.seq_num_first_package, 100);
        assert_eq!(state.seq_num_last_package, 100);
        assert_eq!(state.payload_length, 4);
        assert_eq!(state.em_ssrc, 0xDEADBEEF);
    }

    #[test]
    fn first_packet_only_container_has_one_sample_of_audio() {
        let container = container();
        container.append_package_for_analyse(packet(100, &[0; 160]));
        container.fast_build();

        let state = container.state.lock();
        assert!((state.duration_stream - 0.02).abs() < f64::EPSILON);
        assert_eq!(state.seq_num_first_beep, CODE_AWAIT);
        assert_eq!(state.seq_num_noise_after_answer, CODE_AWAIT);
        assert_eq!(state.seq_num_voice_before_answer, CODE_AWAIT);
        assert_eq!(state.amp_adc_noise, CODE_AWAIT);
        assert_eq!(state.found_first_noise, 0);
    }

    #[test]
    fn sequence_wrap_is_corrected() {
        let container = container();
        container.append_package_for_analyse(packet(0, &[1]));
        {
            let mut state = container.state.lock();
            state.seq_num_first_package = 60_000;
            state.seq_num_last_package = 65_500;
            state.packages_for_analyse.clear();
        }

        container.append_package_for_analyse(packet(5, &[1]));
        container.fast_build();

        let state = container.state.lock();
        assert_eq!(state.number_resets_sequence, 1);
        assert_eq!(state.seq_num_last_package, 65_540);
        assert!(state.analyzed_samples.contains_key(&65_540));
    }

    #[test]
    fn wrap_correction_is_idempotent() {
        let container = container();
        container.append_package_for_analyse(packet(0, &[1]));
        {
            let mut state = container.state.lock();
            state.seq_num_first_package = 60_000;
            state.seq_num_last_package = 66_540;
            state.number_resets_sequence = 1;
            state.packages_for_analyse.clear();
        }

        container.append_package_for_analyse(packet(1_010, &[1]));
        container.fast_build();

        let state = container.state.lock();
        assert_eq!(state.number_resets_sequence, 1);
        assert_eq!(state.seq_num_last_package, 66_545);
    }

    #[test]
    fn gaps_are_filled_with_first_packet_amplitudes() {
        let container = container();
        container.append_package_for_analyse(packet(100, &[7, 8]));
        container.append_package_for_analyse(packet(103, &[9, 10]));
        container.fast_build();

        let state = container.state.lock();
        assert_eq!(state.analyzed_samples.len(), 4);
        assert_eq!(state.analyzed_samples[&101], vec![7, 8]);
        assert_eq!(state.analyzed_samples[&102], vec![7, 8]);
        assert_eq!(state.max_amplitude_samples[&101], 0);
        assert_eq!(state.min_amplitude_samples[&102], 0);
        assert_eq!(state.lost_packets, 2);
        // the filled gaps carry no bytes for the recording
        assert!(!state.bytes_samples.contains_key(&101));
    }

    #[test]
    fn answer_timing_maps_to_sequence_numbers() {
        let container = container();
        container.append_package_for_analyse(packet(1_000, &[0; 160]));
        // payload 320 bytes at s16/8kHz = 0.02 s per packet

        container.add_event_answer(envelope("ANSWER", "2025-01-01T00:00:02Z", json!({})));

        let state = container.state.lock();
        assert_eq!(state.seq_num_answer_package, 1_100);
    }

    #[test]
    fn answer_before_first_packet_is_deferred() {
        let container = container();
        container.add_event_answer(envelope("ANSWER", "2025-01-01T00:00:02Z", json!({})));
        assert_eq!(container.state.lock().seq_num_answer_package, CODE_AWAIT);

        container.append_package_for_analyse(packet(1_000, &[0; 160]));
        container.compute_answer_seq_num();
        assert_eq!(container.state.lock().seq_num_answer_package, 1_100);
    }

    #[test]
    fn found_template_is_write_once() {
        let container = container();
        assert!(container.add_found_template("greeting"));
        assert!(!container.add_found_template("other"));
        assert_eq!(container.found_templates(), "greeting");
    }

    #[test]
    fn detector_admission_gates() {
        let container = container();
        // no packets yet: not admitted
        assert!(container.admit_window(150, 2_000).is_none());

        for seq in 0..120u16 {
            container.append_package_for_analyse(packet(seq, &[3_000; 160]));
        }
        container.fast_build();
        {
            let mut state = container.state.lock();
            state.found_first_noise = 1;
        }

        let window = container.admit_window(150, 2_000).expect("admitted");
        assert_eq!(window.len(), 120 * 160);
        assert!(window.iter().all(|amp| *amp == 3_000));

        // no new data since the last admission
        assert!(container.admit_window(150, 2_000).is_none());
    }

    #[test]
    fn silent_windows_are_not_admitted() {
        let container = container();
        for seq in 0..120u16 {
            container.append_package_for_analyse(packet(seq, &[500; 160]));
        }
        container.fast_build();
        container.state.lock().found_first_noise = 1;

        assert!(container.admit_window(150, 2_000).is_none());
        // but the cursor advanced, the same silent window is not rescanned
        let state = container.state.lock();
        assert_eq!(state.last_detect_seq_num, state.seq_num_last_package);
    }

    #[test]
    fn destroy_tightens_the_hard_deadline() {
        let container = container();
        container.add_event_destroy(envelope("DESTROY", "2025-01-01T00:10:00Z", json!({})));

        let state = container.state.lock();
        assert!(state.break_while_time <= Utc::now() + ChronoDuration::seconds(6));
        assert!(state.event_destroy.is_some());
    }
}
