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

//! Acoustic-event searches over the reassembled timeline. All markers are
//! monotone: once a marker leaves `CODE_AWAIT` it is never revisited, so each
//! search returns early when its marker is already set.

use crate::{
    config::DetectionConfig,
    container::{CODE_AWAIT, CODE_NOT_FOUND, ContainerState},
};
use tracing::{debug, info, warn};

/// First packet whose max amplitude clears the beep threshold. An ANSWER that
/// arrives before any beep rules the marker out for good.
pub fn find_seq_num_first_beep(
    state: &mut ContainerState,
    detection: &DetectionConfig,
    ident: &str,
) {
    if state.seq_num_first_beep != CODE_AWAIT {
        return;
    }

    for (&seq_num, &max_amp) in &state.max_amplitude_samples {
        if state.seq_num_answer_package != CODE_AWAIT {
            warn!("[{ident}] find answer, but not found beep!");
            state.seq_num_first_beep = CODE_NOT_FOUND;
            return;
        } else if max_amp as i32 > detection.amp_beep {
            state.seq_num_first_beep = seq_num;
            debug!("[{ident}] find_first_beep_time seq_num={seq_num}");
            return;
        }
    }
}

/// Baseline of a constant ADC offset: the first packet whose extrema both sit
/// above the noise floor, stay within the beep span and whose min/max ratio
/// is close to one. Only meaningful before any beep or ANSWER.
pub fn find_amp_adc_noise(
    state: &mut ContainerState,
    detection: &DetectionConfig,
    ident: &str,
) {
    if state.amp_adc_noise != CODE_AWAIT {
        return;
    } else if state.seq_num_first_beep > 0 {
        state.amp_adc_noise = CODE_NOT_FOUND;
        return;
    } else if state.event_answer.is_some() {
        state.amp_adc_noise = CODE_NOT_FOUND;
        return;
    }

    for &seq_num in state.analyzed_samples.keys() {
        let max_amp = state
            .max_amplitude_samples
            .get(&seq_num)
            .copied()
            .unwrap_or(0) as i64;
        let min_amp = state
            .min_amplitude_samples
            .get(&seq_num)
            .copied()
            .unwrap_or(0) as i64;

        if min_amp.abs().min(max_amp.abs()) < detection.amp_noise as i64 {
            continue;
        } else if max_amp - min_amp > detection.amp_beep as i64 {
            state.amp_adc_noise = CODE_NOT_FOUND;
            return;
        } else if max_amp != 0 {
            let ratio = min_amp as f64 / max_amp as f64;
            if 0.8 < ratio && ratio < 1.25 {
                let avg = (max_amp + min_amp) / 2;
                debug!(
                    "[{ident}] found ADC noise min_amp={min_amp} and max_amp={max_amp} avg={avg}"
                );
                state.amp_adc_noise = avg;
                return;
            }
        }
    }
}

/// First sustained activity after the ANSWER marker. A leaky counter gains
/// one per packet above the noise floor and decays by 0.3 otherwise; the
/// packet that pushes it past two wins.
pub fn find_seq_num_noise_after_answer(
    state: &mut ContainerState,
    detection: &DetectionConfig,
    ident: &str,
) {
    if state.seq_num_noise_after_answer != CODE_AWAIT {
        return;
    }

    if state.event_answer.is_none() {
        return;
    }

    let mut counter: f64 = 0.0;
    for (&seq_num, &max_amp) in &state.max_amplitude_samples {
        if seq_num < state.seq_num_answer_package {
            continue;
        }

        let mut amp = max_amp as i64;
        if state.amp_adc_noise > 0 {
            amp -= state.amp_adc_noise;
        }

        if amp > detection.amp_noise as i64 {
            counter += 1.0;
        } else {
            counter = (counter - 0.3).max(0.0);
        }

        if counter > 2.0 {
            info!("[{ident}] found noise after answer seq_num={seq_num}");
            state.seq_num_noise_after_answer = seq_num;
            return;
        }
    }
}

/// First voice-level packet before the ANSWER marker. The scan first slides
/// past the beep region: ten consecutive beep-threshold hits extend the
/// region end by fifty packets.
pub fn find_seq_num_voice_before_answer(
    state: &mut ContainerState,
    detection: &DetectionConfig,
    ident: &str,
) {
    if state.seq_num_voice_before_answer != CODE_AWAIT {
        return;
    }

    let mut seq_num_last_beep: i64 = 0;
    let mut counter = 0;
    for (&seq_num, &max_amp) in &state.max_amplitude_samples {
        if seq_num < seq_num_last_beep {
            continue;
        } else if max_amp as i32 > detection.amp_beep {
            counter += 1;
        } else {
            counter = 0;
        }

        if counter > 10 {
            seq_num_last_beep = seq_num + 50;
        }
    }

    // a beep still in progress at the stream end pushes the region past it
    if counter > 1 {
        seq_num_last_beep = state.seq_num_last_package;
    }

    for (&seq_num, &max_amp) in &state.max_amplitude_samples {
        if seq_num < seq_num_last_beep {
            continue;
        }

        if max_amp as i32 > detection.amp_voice {
            info!("[{ident}] found voice before answer seq_num={seq_num}");
            state.seq_num_voice_before_answer = seq_num;
            return;
        }
    }
}

/// The channel stops being absolute silence once any marker is positive or
/// more than one packet spans the noise floor.
pub fn find_first_noise(state: &mut ContainerState, detection: &DetectionConfig, ident: &str) {
    if state.found_first_noise == 1 {
        return;
    } else if state
        .seq_num_first_beep
        .max(state.seq_num_noise_after_answer)
        .max(state.seq_num_voice_before_answer)
        > 0
    {
        state.found_first_noise = 1;
        return;
    }

    let mut counter = 0;
    for (&seq_num, &max_amp) in &state.max_amplitude_samples {
        let min_amp = state
            .min_amplitude_samples
            .get(&seq_num)
            .copied()
            .unwrap_or(0);
        if (max_amp as i32 - min_amp as i32) > detection.amp_noise {
            counter += 1;
        }
    }

    if counter > 1 {
        info!("[{ident}] FOUND FIRST NOISE");
        state.found_first_noise = 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state_with_packets(extrema: &[(i64, i16, i16)]) -> ContainerState {
        let mut state = ContainerState::new();
        for &(seq_num, max_amp, min_amp) in extrema {
            state.analyzed_samples.insert(seq_num, vec![max_amp]);
            state.max_amplitude_samples.insert(seq_num, max_amp);
            state.min_amplitude_samples.insert(seq_num, min_amp);
            state.seq_num_last_package = state.seq_num_last_package.max(seq_num);
        }
        state.seq_num_first_package = extrema.first().map(|it| it.0).unwrap_or(CODE_AWAIT);
        state
    }

    fn detection() -> DetectionConfig {
        DetectionConfig::default()
    }

    #[test]
    fn first_beep_is_first_loud_packet() {
        let mut state = state_with_packets(&[(1, 50, -40), (2, 2_500, -900), (3, 2_600, -900)]);
        find_seq_num_first_beep(&mut state, &detection(), "t");
        assert_eq!(state.seq_num_first_beep, 2);
    }

    #[test]
    fn answer_before_beep_rules_the_beep_out() {
        let mut state = state_with_packets(&[(1, 50, -40), (2, 2_500, -900)]);
        state.seq_num_answer_package = 1;
        find_seq_num_first_beep(&mut state, &detection(), "t");
        assert_eq!(state.seq_num_first_beep, CODE_NOT_FOUND);
    }

    #[test]
    fn adc_noise_baseline_is_packet_average() {
        let mut state = state_with_packets(&[(1, 50, 40), (2, 180, 150)]);
        find_amp_adc_noise(&mut state, &detection(), "t");
        assert_eq!(state.amp_adc_noise, 165);
    }

    #[test]
    fn wide_span_rules_adc_noise_out() {
        let mut state = state_with_packets(&[(1, 2_300, 120)]);
        find_amp_adc_noise(&mut state, &detection(), "t");
        assert_eq!(state.amp_adc_noise, CODE_NOT_FOUND);
    }

    #[test]
    fn noise_after_answer_needs_sustained_activity() {
        let mut state = state_with_packets(&[
            (10, 500, -100),
            (11, 50, -20),
            (12, 500, -100),
            (13, 500, -100),
            (14, 500, -100),
        ]);
        state.seq_num_answer_package = 10;
        state.event_answer = Some(crate::testutil::create_event(0).event);

        find_seq_num_noise_after_answer(&mut state, &detection(), "t");
        // 10 hits, 11 decays to 0.7, 12 and 13 push the counter past two
        assert_eq!(state.seq_num_noise_after_answer, 13);
    }

    #[test]
    fn noise_after_answer_subtracts_the_baseline() {
        let mut state = state_with_packets(&[(10, 160, 0), (11, 160, 0), (12, 160, 0), (13, 160, 0)]);
        state.seq_num_answer_package = 10;
        state.amp_adc_noise = 150;
        state.event_answer = Some(crate::testutil::create_event(0).event);

        find_seq_num_noise_after_answer(&mut state, &detection(), "t");
        // 160 - 150 never clears the noise floor
        assert_eq!(state.seq_num_noise_after_answer, CODE_AWAIT);
    }

    #[test]
    fn voice_search_skips_the_beep_region() {
        let mut extrema: Vec<(i64, i16, i16)> = Vec::new();
        for seq in 0..12 {
            extrema.push((seq, 2_500, -900)); // beep run extends the region
        }
        extrema.push((12, 300, -100)); // voice inside the region, skipped
        for seq in 13..61 {
            extrema.push((seq, 50, -20));
        }
        extrema.push((61, 300, -100)); // first voice past the region
        let mut state = state_with_packets(&extrema);

        find_seq_num_voice_before_answer(&mut state, &detection(), "t");
        assert_eq!(state.seq_num_voice_before_answer, 61);
    }

    #[test]
    fn first_noise_needs_more_than_one_active_packet() {
        let mut state = state_with_packets(&[(1, 500, -100), (2, 30, -20)]);
        find_first_noise(&mut state, &detection(), "t");
        assert_eq!(state.found_first_noise, 0);

        state.max_amplitude_samples.insert(3, 400);
        state.min_amplitude_samples.insert(3, -100);
        find_first_noise(&mut state, &detection(), "t");
        assert_eq!(state.found_first_noise, 1);
    }

    #[test]
    fn positive_marker_sets_first_noise() {
        let mut state = state_with_packets(&[(1, 10, -10)]);
        state.seq_num_first_beep = 7;
        find_first_noise(&mut state, &detection(), "t");
        assert_eq!(state.found_first_noise, 1);
    }
}
