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

//! Call-lifecycle events received on the HTTP control plane. Every event
//! shares the same envelope; CREATE and DETECT carry typed `info` payloads,
//! the rest keep theirs as loose JSON.

use crate::error::{CallsonicError, CallsonicResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Event {
    pub event_name: String,
    pub event_time: String,
    pub call_id: String,
    pub chan_id: String,
    pub send_time: String,
    pub token: String,
    #[serde(default)]
    pub info: Value,
}

impl Event {
    pub fn event_time(&self) -> CallsonicResult<DateTime<Utc>> {
        parse_event_time(&self.event_time)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateInfo {
    pub chan_id: String,
    pub em_host: String,
    pub em_port: u16,
    pub em_codec: String,
    pub em_wait_seconds: u64,
    pub em_sample_rate: u32,
    pub em_sample_width: u16,
    pub save_record: u8,
    pub save_format: String,
    pub save_sample_rate: u32,
    pub save_sample_width: u16,
    pub save_filename: String,
    pub save_concat_call_id: String,
    pub speech_recognition: u8,
    pub detection_autoresponse: u8,
    pub detection_voice_start: u8,
    pub detection_absolute_silence: u8,
    pub callback_host: String,
    pub callback_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectInfo {
    pub em_host: String,
    pub em_port: u16,
    pub em_ssrc: u32,
    #[serde(default)]
    pub from_detect_time: Option<f64>,
    #[serde(default)]
    pub to_detect_time: Option<f64>,
    #[serde(default)]
    pub stop_words: Vec<String>,
    #[serde(default)]
    pub stop_after_noise_and_silence: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EventCreate {
    pub event: Event,
    pub info: CreateInfo,
}

#[derive(Debug, Clone)]
pub struct EventDetect {
    pub event: Event,
    pub info: DetectInfo,
}

/// An envelope dispatched by its `event_name`. Unknown names are rejected so
/// the control plane can answer 404, malformed `info` payloads so it can
/// answer 422.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Create(EventCreate),
    Progress(Event),
    Answer(Event),
    Detect(EventDetect),
    Destroy(Event),
}

impl LifecycleEvent {
    pub fn from_event(event: Event) -> CallsonicResult<LifecycleEvent> {
        match event.event_name.as_str() {
            "CREATE" => {
                let info = serde_json::from_value(event.info.clone())
                    .map_err(|e| CallsonicError::InvalidEvent(e.to_string()))?;
                Ok(LifecycleEvent::Create(EventCreate { event, info }))
            }
            "PROGRESS" => Ok(LifecycleEvent::Progress(event)),
            "ANSWER" => Ok(LifecycleEvent::Answer(event)),
            "DETECT" => {
                let info = serde_json::from_value(event.info.clone())
                    .map_err(|e| CallsonicError::InvalidEvent(e.to_string()))?;
                Ok(LifecycleEvent::Detect(EventDetect { event, info }))
            }
            "DESTROY" => Ok(LifecycleEvent::Destroy(event)),
            other => Err(CallsonicError::UnknownEvent(other.to_owned())),
        }
    }

    pub fn chan_id(&self) -> &str {
        match self {
            LifecycleEvent::Create(e) => &e.event.chan_id,
            LifecycleEvent::Progress(e)
            | LifecycleEvent::Answer(e)
            | LifecycleEvent::Destroy(e) => &e.chan_id,
            LifecycleEvent::Detect(e) => &e.event.chan_id,
        }
    }
}

pub fn parse_event_time(value: &str) -> CallsonicResult<DateTime<Utc>> {
    if let Ok(it) = DateTime::parse_from_rfc3339(value) {
        return Ok(it.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn envelope(event_name: &str, info: Value) -> Event {
        Event {
            event_name: event_name.to_owned(),
            event_time: "2025-01-01T00:00:00Z".to_owned(),
            call_id: "call-1".to_owned(),
            chan_id: "chan-1".to_owned(),
            send_time: "2025-01-01T00:00:00Z".to_owned(),
            token: "token".to_owned(),
            info,
        }
    }

    #[test]
    fn create_requires_typed_info() {
        let event = envelope(
            "CREATE",
            json!({
                "chan_id": "chan-1",
                "em_host": "10.0.0.1",
                "em_port": 4000,
                "em_codec": "slin",
                "em_wait_seconds": 60,
                "em_sample_rate": 8000,
                "em_sample_width": 2,
                "save_record": 1,
                "save_format": "wav",
                "save_sample_rate": 8000,
                "save_sample_width": 2,
                "save_filename": "chan-1",
                "save_concat_call_id": "",
                "speech_recognition": 0,
                "detection_autoresponse": 1,
                "detection_voice_start": 0,
                "detection_absolute_silence": 0,
                "callback_host": "10.0.0.2",
                "callback_port": 8000
            }),
        );
        match LifecycleEvent::from_event(event).expect("valid create") {
            LifecycleEvent::Create(create) => {
                assert_eq!(create.info.em_port, 4000);
                assert_eq!(create.info.save_record, 1);
            }
            other => panic!("expected CREATE, got {other:?}"),
        }
    }

    #[test]
    fn create_with_broken_info_is_invalid() {
        let event = envelope("CREATE", json!({ "em_host": "10.0.0.1" }));
        assert!(matches!(
            LifecycleEvent::from_event(event),
            Err(CallsonicError::InvalidEvent(_))
        ));
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let event = envelope("RINGING", Value::Null);
        assert!(matches!(
            LifecycleEvent::from_event(event),
            Err(CallsonicError::UnknownEvent(_))
        ));
    }

    #[test]
    fn event_times_parse_with_and_without_zone() {
        assert!(parse_event_time("2025-01-01T00:00:02Z").is_ok());
        assert!(parse_event_time("2025-01-01T00:00:02.250").is_ok());
        assert!(parse_event_time("not a time").is_err());
    }
}
