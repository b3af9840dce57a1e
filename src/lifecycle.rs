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

//! The lifecycle controller. Maps control-plane events to container state:
//! CREATE allocates a container and announces its RTP flow to the
//! dispatcher's pending map, the remaining events are applied to the
//! container once it exists, retrying briefly because RTP binding and HTTP
//! notifications race each other.

use crate::{
    app::App,
    client::CallbackClient,
    container::AudioContainer,
    error::{CallsonicError, CallsonicResult},
    events::{EventCreate, LifecycleEvent},
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const CONTAINER_WAIT_ATTEMPTS: usize = 5;
const CONTAINER_WAIT_DELAY: Duration = Duration::from_millis(200);

pub async fn handle_event(app: &Arc<App>, event: LifecycleEvent) -> CallsonicResult<()> {
    match event {
        LifecycleEvent::Create(create) => start_event_create(app, create).await,
        LifecycleEvent::Progress(event) => {
            let container = wait_for_container(app, &event.chan_id).await?;
            info!(
                "event_name={} and call_id={}",
                event.event_name, event.call_id
            );
            container.add_event_progress(event);
            Ok(())
        }
        LifecycleEvent::Answer(event) => {
            let container = wait_for_container(app, &event.chan_id).await?;
            info!(
                "event_name={} and call_id={}",
                event.event_name, event.call_id
            );
            container.add_event_answer(event);
            Ok(())
        }
        LifecycleEvent::Detect(detect) => {
            let container = wait_for_container(app, &detect.event.chan_id).await?;
            info!(
                "event_name={} and call_id={}",
                detect.event.event_name, detect.event.call_id
            );
            container.add_event_detect(detect);
            Ok(())
        }
        LifecycleEvent::Destroy(event) => {
            let container = wait_for_container(app, &event.chan_id).await?;
            info!(
                "event_name={} and call_id={}",
                event.event_name, event.call_id
            );
            container.add_event_destroy(event);
            Ok(())
        }
    }
}

async fn start_event_create(app: &Arc<App>, create: EventCreate) -> CallsonicResult<()> {
    let em_address = format!("{}:{}", create.info.em_host, create.info.em_port);
    info!(
        "event_name={} and call_id={} em_address={em_address}",
        create.event.event_name, create.event.call_id
    );

    if create.info.em_sample_rate != app.config.detection.sample_rate
        || create.info.em_sample_width != app.config.detection.sample_width
    {
        warn!(
            "[{}] correct work with sample_rate={} sample_width={} is not guaranteed",
            create.event.chan_id, create.info.em_sample_rate, create.info.em_sample_width
        );
    }

    let callback = callback_client(app, &create.info.callback_host, create.info.callback_port);

    let chan_id = create.event.chan_id.clone();
    let container = Arc::new(AudioContainer::new(
        app.config.clone(),
        app.alive.clone(),
        create,
        callback,
    ));

    app.pending.insert(em_address, chan_id.clone());
    app.containers.insert(chan_id, container);

    Ok(())
}

/// One shared client per callback endpoint; a fresh client probes the peer's
/// diag route in the background.
fn callback_client(app: &Arc<App>, host: &str, port: u16) -> Arc<CallbackClient> {
    let callback_address = format!("{host}:{port}");

    if let Some(existing) = app.callback_clients.get(&callback_address) {
        debug!("callback client {callback_address} already exists");
        return existing.clone();
    }

    debug!("start create callback client {callback_address}");
    let client = Arc::new(CallbackClient::new(host, port));
    app.callback_clients
        .insert(callback_address, client.clone());

    let probe = client.clone();
    tokio::spawn(async move {
        probe.check_diag().await;
    });

    client
}

async fn wait_for_container(
    app: &Arc<App>,
    chan_id: &str,
) -> CallsonicResult<Arc<AudioContainer>> {
    for _ in 0..CONTAINER_WAIT_ATTEMPTS {
        if let Some(container) = app.containers.get(chan_id).map(|it| it.clone()) {
            return Ok(container);
        }
        sleep(CONTAINER_WAIT_DELAY).await;
    }

    error!("chan_id={chan_id} not found");
    Err(CallsonicError::UnknownChannel(chan_id.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::Config,
        events::Event,
        template::TemplateLibrary,
        testutil::{create_event, envelope},
    };
    use serde_json::json;

    fn answer_event() -> Event {
        envelope("ANSWER", "2025-01-01T00:00:02Z", json!({}))
    }

    #[tokio::test]
    async fn create_allocates_container_and_pending_flow() {
        let app = App::new(Config::default(), TemplateLibrary::empty());
        handle_event(&app, LifecycleEvent::Create(create_event(0)))
            .await
            .expect("create handled");

        assert!(app.containers.contains_key("chan-1"));
        assert_eq!(
            app.pending.get("10.0.0.1:4000").map(|it| it.clone()),
            Some("chan-1".to_owned())
        );
        assert_eq!(app.callback_clients.len(), 1);
    }

    #[tokio::test]
    async fn callback_clients_are_cached_per_endpoint() {
        let app = App::new(Config::default(), TemplateLibrary::empty());
        handle_event(&app, LifecycleEvent::Create(create_event(0)))
            .await
            .expect("create handled");
        // second call with the same endpoint reuses the client
        let mut second = create_event(0);
        second.event.chan_id = "chan-2".to_owned();
        handle_event(&app, LifecycleEvent::Create(second))
            .await
            .expect("create handled");

        assert_eq!(app.callback_clients.len(), 1);
        assert_eq!(app.containers.len(), 2);
    }

    #[tokio::test]
    async fn answer_reaches_the_container() {
        let app = App::new(Config::default(), TemplateLibrary::empty());
        handle_event(&app, LifecycleEvent::Create(create_event(0)))
            .await
            .expect("create handled");
        handle_event(&app, LifecycleEvent::Answer(answer_event()))
            .await
            .expect("answer handled");

        let container = app.containers.get("chan-1").expect("container").clone();
        assert!(!container.is_destroyed());
    }

    #[tokio::test]
    async fn event_for_unknown_channel_fails_after_retries() {
        let app = App::new(Config::default(), TemplateLibrary::empty());
        let result = handle_event(&app, LifecycleEvent::Destroy(answer_event())).await;
        assert!(matches!(result, Err(CallsonicError::UnknownChannel(_))));
    }
}
