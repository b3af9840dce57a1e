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

//! The HTTP control plane: lifecycle events in, diagnostics and restart out.

use crate::{
    app::App,
    error::{CallsonicError, CallsonicResult},
    events::{Event, LifecycleEvent},
    lifecycle,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::{net::TcpListener, select, sync::mpsc};
use tokio_graceful_shutdown::SubsystemHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

#[derive(Clone)]
struct ApiState {
    app: Arc<App>,
    restart_tx: mpsc::Sender<()>,
}

pub async fn webserver(subsys: SubsystemHandle, app: Arc<App>) -> CallsonicResult<()> {
    let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);

    let state = ApiState {
        app: app.clone(),
        restart_tx,
    };

    let router = Router::new()
        .route("/events", post(events))
        .route("/diag", get(diag))
        .route("/restart", post(restart))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let bind_address = format!(
        "{}:{}",
        app.config.app_api_host, app.config.app_api_port
    );
    info!("Listening on {bind_address} …");
    let listener = TcpListener::bind(&bind_address).await?;
    info!("REST endpoint up at http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            select! {
                _ = subsys.on_shutdown_requested() => (),
                _ = restart_rx.recv() => {
                    app.shutdown();
                    subsys.request_shutdown();
                }
            }
        })
        .await?;

    Ok(())
}

#[instrument(skip(state, event), fields(event_name = %event.event_name, chan_id = %event.chan_id))]
async fn events(
    State(state): State<ApiState>,
    Json(event): Json<Event>,
) -> CallsonicResult<Json<Value>> {
    let receive_time = Utc::now().to_rfc3339();

    let response = json!({
        "call_id": event.call_id,
        "event_name": event.event_name,
        "send_time": event.send_time,
        "receive_time": receive_time,
    });

    let event = LifecycleEvent::from_event(event)?;
    lifecycle::handle_event(&state.app, event).await?;

    Ok(Json(response))
}

async fn diag(State(state): State<ApiState>) -> Json<Value> {
    Json(state.app.diag())
}

#[instrument(skip(state))]
async fn restart(State(state): State<ApiState>) -> CallsonicResult<Json<Value>> {
    state
        .restart_tx
        .send(())
        .await
        .map_err(|_| CallsonicError::Other("restart channel closed".to_owned()))?;

    Ok(Json(json!({
        "app": state.app.config.app_name,
        "shutdown": true,
        "alive": state.app.is_alive(),
        "msg": "app restart started",
        "current_time": Utc::now().to_rfc3339(),
    })))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "msg": "Not found" })))
}
