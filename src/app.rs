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

//! The application value. Everything that used to live in process-global
//! state is constructed once at startup and handed to the components as an
//! `Arc<App>`: the config, the container table, the RTP binding maps, the
//! callback-client cache, the template library and the process counters.

use crate::{
    client::CallbackClient, config::Config, container::AudioContainer, template::TemplateLibrary,
};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

#[derive(Debug, Default)]
pub struct Stats {
    pub packets_received: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub packets_routed: AtomicU64,
    pub packets_lost: AtomicU64,
    pub batches_received: AtomicU64,
    pub templates_matched: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> Value {
        json!({
            "packets_received": self.packets_received.load(Ordering::Relaxed),
            "packets_malformed": self.packets_malformed.load(Ordering::Relaxed),
            "packets_routed": self.packets_routed.load(Ordering::Relaxed),
            "packets_lost": self.packets_lost.load(Ordering::Relaxed),
            "batches_received": self.batches_received.load(Ordering::Relaxed),
            "templates_matched": self.templates_matched.load(Ordering::Relaxed),
        })
    }
}

pub struct App {
    pub config: Arc<Config>,
    /// Cleared on shutdown; the receiver thread and the container parse
    /// loops watch it.
    pub alive: Arc<AtomicBool>,
    pub wait_shutdown: AtomicBool,
    pub stats: Stats,
    /// chan_id → container.
    pub containers: DashMap<String, Arc<AudioContainer>>,
    /// "SSRC@host:port" → chan_id, flows with at least one RTP packet.
    pub bound: DashMap<String, String>,
    /// "host:port" → chan_id, waiting for the first RTP packet.
    pub pending: DashMap<String, String>,
    /// "callback_host:port" → shared client.
    pub callback_clients: DashMap<String, Arc<CallbackClient>>,
    pub library: Arc<TemplateLibrary>,
}

impl App {
    pub fn new(config: Config, library: TemplateLibrary) -> Arc<App> {
        let alive = config.alive;
        let wait_shutdown = config.wait_shutdown;
        Arc::new(App {
            config: Arc::new(config),
            alive: Arc::new(AtomicBool::new(alive)),
            wait_shutdown: AtomicBool::new(wait_shutdown),
            stats: Stats::default(),
            containers: DashMap::new(),
            bound: DashMap::new(),
            pending: DashMap::new(),
            callback_clients: DashMap::new(),
            library: Arc::new(library),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.wait_shutdown.store(true, Ordering::Relaxed);
    }

    pub fn diag(&self) -> Value {
        json!({
            "app": self.config.app_name,
            "alive": self.is_alive(),
            "shutdown": self.wait_shutdown.load(Ordering::Relaxed),
            "current_time": chrono::Utc::now().to_rfc3339(),
            "containers": self.containers.len(),
            "bound_streams": self.bound.len(),
            "pending_streams": self.pending.len(),
            "templates": self.library.templates.len(),
            "stats": self.stats.snapshot(),
        })
    }
}
