//! Shared fixtures for the unit tests: a CREATE event with a plausible
//! telephony profile, raw RTP packet builders and a ready-made container.

use crate::{
    client::CallbackClient,
    config::Config,
    container::AudioContainer,
    events::{Event, EventCreate, LifecycleEvent},
    packet::Packet,
};
use serde_json::json;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, atomic::AtomicBool},
};

pub(crate) fn envelope(event_name: &str, event_time: &str, info: serde_json::Value) -> Event {
    Event {
        event_name: event_name.to_owned(),
        event_time: event_time.to_owned(),
        call_id: "call-1".to_owned(),
        chan_id: "chan-1".to_owned(),
        send_time: event_time.to_owned(),
        token: "token".to_owned(),
        info,
    }
}

pub(crate) fn create_event(save_record: u8) -> EventCreate {
    let event = envelope(
        "CREATE",
        "2025-01-01T00:00:00Z",
        json!({
            "chan_id": "chan-1",
            "em_host": "10.0.0.1",
            "em_port": 4000,
            "em_codec": "slin",
            "em_wait_seconds": 60,
            "em_sample_rate": 8000,
            "em_sample_width": 2,
            "save_record": save_record,
            "save_format": "wav",
            "save_sample_rate": 8000,
            "save_sample_width": 2,
            "save_filename": "chan-1",
            "save_concat_call_id": "",
            "speech_recognition": 0,
            "detection_autoresponse": 1,
            "detection_voice_start": 0,
            "detection_absolute_silence": 0,
            "callback_host": "127.0.0.1",
            "callback_port": 18000
        }),
    );
    match LifecycleEvent::from_event(event).expect("valid create") {
        LifecycleEvent::Create(create) => create,
        _ => unreachable!(),
    }
}

pub(crate) fn rtp_packet(seq_num: u16, port: u16, amplitudes: &[i16]) -> Packet {
    let mut data = vec![0x80, 0x00];
    data.extend(seq_num.to_be_bytes());
    data.extend(0u32.to_be_bytes());
    data.extend(0xDEADBEEFu32.to_be_bytes());
    for amp in amplitudes {
        data.extend(amp.to_be_bytes());
    }
    Packet::parse(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port, &data).expect("valid rtp")
}

pub(crate) fn test_container() -> AudioContainer {
    AudioContainer::new(
        Arc::new(Config::default()),
        Arc::new(AtomicBool::new(true)),
        create_event(0),
        Arc::new(CallbackClient::new("127.0.0.1", 18000)),
    )
}
