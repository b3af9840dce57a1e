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

use callsonic::{
    app::App, config::Config, detector, dispatcher, receiver, telemetry,
    template::TemplateLibrary, webserver,
};
use miette::Result;
use std::{path::Path, time::Duration};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::load().await?;

    telemetry::init(&config)?;

    info!(
        "Starting {} with API on {}:{} and RTP on {}:{}",
        config.app_name,
        config.app_api_host,
        config.app_api_port,
        config.app_unicast_host,
        config.app_unicast_port
    );

    let template_folder = Path::new(&config.template_folder_path).to_owned();
    let library = match TemplateLibrary::load(&template_folder, &config) {
        Ok(library) => library,
        Err(e) => {
            warn!(
                "could not load templates from {}: {e}, starting with an empty library",
                template_folder.to_string_lossy()
            );
            TemplateLibrary::empty()
        }
    };

    let app = App::new(config, library);

    let (batch_tx, batch_rx) = crossbeam::channel::unbounded();
    let receiver_handle = receiver::start_receiver(app.clone(), batch_tx)?;

    let dispatcher_app = app.clone();
    let detector_app = app.clone();
    let webserver_app = app.clone();

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("dispatcher", move |s| {
            dispatcher::dispatcher(s, dispatcher_app, batch_rx)
        }));
        s.start(SubsystemBuilder::new("detector", move |s| {
            detector::detector(s, detector_app)
        }));
        s.start(SubsystemBuilder::new("webserver", move |s| {
            webserver::webserver(s, webserver_app)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await?;

    info!("Shutting down");
    app.shutdown();
    if let Err(e) = receiver_handle.join() {
        error!("receiver thread panicked: {e:?}");
    }

    Ok(())
}
