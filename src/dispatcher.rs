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

//! The dispatcher. A single cooperative task drains packet batches from the
//! receiver queue and routes each packet to the container owning its
//! `(host, port, SSRC)` identity. Flows announce themselves through the
//! pending map (filled by CREATE) and are bound to their SSRC on the first
//! packet; packets that arrive before their CREATE wait until their
//! `lose_time` and are then counted as lost.

use crate::{app::App, packet::Packet};
use chrono::Utc;
use crossbeam::channel::Receiver;
use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};
use tokio::{select, time::sleep};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};

const EMPTY_QUEUE_SLEEP: Duration = Duration::from_millis(100);
const ALLOC_TIMES_LOG_COUNT: usize = 400;

pub async fn dispatcher(
    subsys: SubsystemHandle,
    app: Arc<App>,
    batch_rx: Receiver<Vec<Packet>>,
) -> Result<(), &'static str> {
    info!("dispatcher started");

    let mut dispatcher = Dispatcher {
        app,
        deferred: Vec::new(),
        stress_peak: 0,
        alloc_times: Vec::new(),
    };

    loop {
        let batch = match batch_rx.try_recv() {
            Ok(batch) => batch,
            Err(_) => {
                select! {
                    _ = sleep(EMPTY_QUEUE_SLEEP) => Vec::new(),
                    _ = subsys.on_shutdown_requested() => break,
                }
            }
        };

        if batch.is_empty() && dispatcher.deferred.is_empty() {
            continue;
        }

        dispatcher.dispatch(batch);

        if subsys.is_shutdown_requested() {
            break;
        }
    }

    info!("dispatcher stopped");
    Ok(())
}

struct Dispatcher {
    app: Arc<App>,
    deferred: Vec<Packet>,
    stress_peak: usize,
    alloc_times: Vec<f64>,
}

impl Dispatcher {
    /// Route one batch. Deferred packets from earlier rounds go first, the
    /// whole round is processed in ascending sequence-number order.
    fn dispatch(&mut self, batch: Vec<Packet>) {
        let t1 = Instant::now();

        let mut packages = std::mem::take(&mut self.deferred);
        packages.extend(batch);

        let len_queue = packages.len();
        if len_queue > self.stress_peak + 99 {
            self.stress_peak = len_queue;
            debug!("update stress peak={}", self.stress_peak);
        } else if len_queue > 0 {
            self.stress_peak = self.stress_peak.saturating_sub(1);
        } else {
            return;
        }

        packages.sort_by_key(|package| package.seq_num);

        let mut lose_packages = 0u64;
        for package in packages {
            if let Some(chan_id) = self
                .app
                .bound
                .get(&package.em_address_ssrc)
                .map(|it| it.clone())
            {
                self.route(&chan_id, package);
            } else if let Some((_, chan_id)) = self.app.pending.remove(&package.em_address) {
                self.app
                    .bound
                    .insert(package.em_address_ssrc.clone(), chan_id.clone());
                self.route(&chan_id, package);
            } else if Utc::now() < package.lose_time {
                self.deferred.push(package);
            } else {
                lose_packages += 1;
            }
        }

        if lose_packages > 0 {
            warn!("lose_packages: {lose_packages}");
            self.app
                .stats
                .packets_lost
                .fetch_add(lose_packages, Ordering::Relaxed);
        }

        let alloc_time = t1.elapsed().as_secs_f64();
        self.alloc_times.push(alloc_time);
        if alloc_time > 1.0 {
            warn!("Huge alloc_time: {alloc_time}");
        } else if self.alloc_times.len() > ALLOC_TIMES_LOG_COUNT {
            let sum: f64 = self.alloc_times.iter().sum();
            let max = self.alloc_times.iter().cloned().fold(0.0, f64::max);
            info!(
                "avg_alloc_time={} max_alloc_time={max}",
                sum / self.alloc_times.len() as f64
            );
            self.alloc_times.clear();
        }
    }

    fn route(&self, chan_id: &str, package: Packet) {
        let Some(container) = self.app.containers.get(chan_id).map(|it| it.clone()) else {
            return;
        };

        self.app.stats.packets_routed.fetch_add(1, Ordering::Relaxed);
        if container.append_package_for_analyse(package) {
            tokio::spawn(container.clone().run_parse_loop());
        }
    }
}
