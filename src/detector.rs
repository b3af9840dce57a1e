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

//! The detector. A prepare loop admits the most recent audio window of every
//! eligible container, a matcher loop computes fingerprints on the blocking
//! pool and matches them against the template library under the
//! temporal-consistency rule. Windows complete in whatever order the workers
//! finish; correctness does not depend on it because a container's match is
//! recorded at most once.

use crate::{
    app::App,
    error::CallsonicError,
    fingerprint::{FingerPrint, get_fingerprint, render},
    template::TemplateLibrary,
};
use futures::{StreamExt, stream::FuturesUnordered};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc, task::JoinHandle, time::sleep};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{error, info, warn};

/// Entries of the timeline admitted per window, roughly the last three
/// seconds of a 20 ms-packet stream.
const WINDOW_PACKETS: usize = 150;

/// Shared hashes required before a template is considered at all.
const MIN_SHARED_HASHES: usize = 11;

/// Allowed deviation of a hash's offset difference from the median.
const TIMELY_TOLERANCE: f64 = 3.0;

const PREPARE_SLEEP: Duration = Duration::from_millis(100);

const PNG_FOLDER: &str = "fingerprint_record";

pub async fn detector(subsys: SubsystemHandle, app: Arc<App>) -> Result<(), CallsonicError> {
    info!("start_detection");
    cross_check(&app.library);

    let (window_tx, window_rx) = mpsc::channel(64);

    let prepare_app = app.clone();
    subsys.start(SubsystemBuilder::new("prepare", move |s| {
        prepare_loop(s, prepare_app, window_tx)
    }));
    subsys.start(SubsystemBuilder::new("matcher", move |s| {
        matcher_loop(s, app, window_rx)
    }));

    subsys.on_shutdown_requested().await;
    Ok(())
}

/// Warn about templates whose fingerprints collide with each other; such
/// pairs will race for the same calls at runtime.
pub fn cross_check(library: &TemplateLibrary) {
    let mut names: Vec<&String> = library.templates.keys().collect();
    names.sort();

    for name in names {
        let template = &library.templates[name];
        if let Some(found) = analyse_fingerprint(
            library,
            &template.fingerprint,
            Some(name.as_str()),
            false,
        ) {
            warn!(
                "Found cross template: {name} >> {} match_count={} hash_count_1={} hash_count_2={}",
                found.template_name,
                found.match_count,
                template.fingerprint.len(),
                library.templates[&found.template_name].fingerprint.len()
            );
        }
    }
}

async fn prepare_loop(
    subsys: SubsystemHandle,
    app: Arc<App>,
    window_tx: mpsc::Sender<(String, Vec<i16>)>,
) -> Result<(), CallsonicError> {
    info!("start loop for prepare amplitudes");
    let min_amplitude = app.config.detection.min_amplitude_for_detection as i16;

    loop {
        select! {
            _ = sleep(PREPARE_SLEEP) => {}
            _ = subsys.on_shutdown_requested() => break,
        }

        if app.containers.is_empty() {
            continue;
        }

        let containers: Vec<(String, Arc<crate::container::AudioContainer>)> = app
            .containers
            .iter()
            .map(|it| (it.key().clone(), it.value().clone()))
            .collect();

        for (chan_id, container) in containers {
            if let Some(window) = container.admit_window(WINDOW_PACKETS, min_amplitude) {
                if window_tx.send((chan_id, window)).await.is_err() {
                    info!("matcher is gone, stopping prepare loop");
                    return Ok(());
                }
            }
        }
    }

    info!("end prepare loop");
    Ok(())
}

type FingerprintJob = JoinHandle<(String, crate::error::CallsonicResult<FingerPrint>)>;

async fn matcher_loop(
    subsys: SubsystemHandle,
    app: Arc<App>,
    mut window_rx: mpsc::Receiver<(String, Vec<i16>)>,
) -> Result<(), CallsonicError> {
    info!("start run_detection");
    let mut jobs: FuturesUnordered<FingerprintJob> = FuturesUnordered::new();

    loop {
        select! {
            _ = subsys.on_shutdown_requested() => break,
            received = window_rx.recv() => {
                let Some((chan_id, window)) = received else { break };
                let config = app.config.clone();
                jobs.push(tokio::task::spawn_blocking(move || {
                    let fingerprint = get_fingerprint(
                        &chan_id,
                        &window,
                        config.detection.sample_rate,
                        &config.fingerprint,
                    );
                    (chan_id, fingerprint)
                }));
            }
            Some(joined) = jobs.next(), if !jobs.is_empty() => {
                match joined {
                    Ok((chan_id, Ok(fingerprint))) => {
                        process_fingerprint(&app, &chan_id, fingerprint).await;
                    }
                    Ok((chan_id, Err(e))) => {
                        // one bad window never aborts detection
                        error!("fingerprint of {chan_id} failed: {e}");
                    }
                    Err(e) => error!("fingerprint worker crashed: {e}"),
                }
            }
        }
    }

    info!("end run_detection");
    Ok(())
}

async fn process_fingerprint(app: &Arc<App>, chan_id: &str, fingerprint: FingerPrint) {
    let t1 = Instant::now();
    let detect_result = analyse_fingerprint(&app.library, &fingerprint, None, true);

    let Some(container) = app.containers.get(chan_id).map(|it| it.clone()) else {
        return;
    };
    container.add_detect_duration(t1.elapsed().as_secs_f64());

    let Some(result) = detect_result else {
        return;
    };

    if !container.add_found_template(&result.template_name) {
        return;
    }
    app.stats.templates_matched.fetch_add(1, Ordering::Relaxed);

    if app.config.save_png_match_detection {
        let print_name = format!("{chan_id}_{}", result.template_name);
        let hashes = result.matching_hashes.clone();
        let shift = result.shift;
        tokio::task::spawn_blocking(move || {
            if let Err(e) =
                render::save_matching_print(&fingerprint, &hashes, PNG_FOLDER, &print_name, shift)
            {
                error!("saving match rendering failed: {e}");
            }
        });
    }

    let callback = container.callback.clone();
    let chan_id = chan_id.to_owned();
    let call_id = container.call_id.clone();
    let template_name = result.template_name.clone();
    let match_count = result.match_count;
    tokio::spawn(async move {
        callback
            .send_detection(&chan_id, &call_id, &template_name, match_count)
            .await;
    });
}

#[derive(Debug, Clone)]
pub struct DetectResult {
    pub template_name: String,
    pub match_count: usize,
    pub shift: i64,
    pub matching_hashes: Vec<String>,
}

/// Match a fingerprint against the library. Candidates are evaluated in
/// descending shared-hash-count order (name order on ties); the first
/// candidate passing the temporal-consistency rule wins.
pub fn analyse_fingerprint(
    library: &TemplateLibrary,
    ac_print: &FingerPrint,
    skip_template_name: Option<&str>,
    real_search: bool,
) -> Option<DetectResult> {
    let mut similar: HashMap<&str, Vec<&String>> = HashMap::new();
    for ac_hash in ac_print.hashes_offsets.keys() {
        if let Some(names) = library.hash_index.get(ac_hash) {
            for template_name in names {
                similar
                    .entry(template_name.as_str())
                    .or_default()
                    .push(ac_hash);
            }
        }
    }

    let mut candidates: Vec<(&str, Vec<&String>)> = similar.into_iter().collect();
    candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    for (template_name, shared_hashes) in candidates {
        let count_start_points = shared_hashes.len();
        if count_start_points < MIN_SHARED_HASHES {
            continue;
        }
        if Some(template_name) == skip_template_name {
            continue;
        }
        let Some(template) = library.templates.get(template_name) else {
            continue;
        };

        let (timely_hashes, shift) = get_timely_hashes(
            &ac_print.hashes_offsets,
            &template.fingerprint.hashes_offsets,
        );
        let offset_times: BTreeSet<i64> = timely_hashes.values().copied().collect();

        let (len_timely_hashes, len_offset_times) = (timely_hashes.len(), offset_times.len());
        if len_timely_hashes < 5 || len_offset_times < 2 {
            continue;
        }

        let match_count = len_timely_hashes + len_offset_times * 15;
        if match_count < 80 {
            if match_count > 60 {
                info!(
                    "match_count={match_count} {} > {template_name}",
                    ac_print.print_name
                );
            }
            continue;
        }

        if real_search {
            info!(
                "len points:{len_timely_hashes} template:{template_name} chan_id:{} \
                 len offset_times: {len_offset_times}, count_start_points: {count_start_points}",
                ac_print.print_name
            );
        }

        return Some(DetectResult {
            template_name: template_name.to_owned(),
            match_count,
            shift,
            matching_hashes: shared_hashes.into_iter().cloned().collect(),
        });
    }

    None
}

/// Temporal consistency: per shared hash, subtract the template's anchor
/// offset from the query's; hashes whose difference stays within the
/// tolerance around the median survive. The median is the estimated shift of
/// the template inside the query window.
pub fn get_timely_hashes(
    source_hashes_offsets: &BTreeMap<String, i64>,
    template_hashes_offsets: &BTreeMap<String, i64>,
) -> (BTreeMap<String, i64>, i64) {
    let mut diffs: Vec<(&String, i64)> = Vec::new();
    for (hash, source_offset) in source_hashes_offsets {
        if let Some(template_offset) = template_hashes_offsets.get(hash) {
            diffs.push((hash, source_offset - template_offset));
        }
    }

    if diffs.is_empty() {
        return (BTreeMap::new(), 0);
    }

    let mut values: Vec<i64> = diffs.iter().map(|(_, diff)| *diff).collect();
    values.sort_unstable();
    let mid = values.len() / 2;
    let median: f64 = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) as f64 / 2.0
    } else {
        values[mid] as f64
    };

    let timely = diffs
        .into_iter()
        .filter(|(_, diff)| (*diff as f64 - median).abs() <= TIMELY_TOLERANCE)
        .map(|(hash, _)| {
            let offset = source_hashes_offsets.get(hash).copied().unwrap_or(0);
            (hash.clone(), offset)
        })
        .collect();

    (timely, median.round() as i64)
}
