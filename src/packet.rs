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

//! Parsed RTP datagrams. A [`Packet`] is immutable after parse and carries
//! everything downstream stages need: the raw header fields, the decoded
//! big-endian s16 amplitude vector with its cached extrema, the little-endian
//! byte form for the WAV sink and the binding identities used by the
//! dispatcher.

use crate::error::{CallsonicError, CallsonicResult, WrappedRtpError};
use chrono::{DateTime, Duration, Utc};
use rtp_rs::RtpReader;
use std::net::IpAddr;

/// How long an unbound packet may wait for its container.
const LOSE_AFTER_SECONDS: i64 = 5;

#[derive(Debug, Clone)]
pub struct Packet {
    pub em_host: IpAddr,
    pub em_port: u16,
    pub csrc_count: u8,
    pub payload_type: u8,
    pub seq_num: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
    pub amplitudes: Vec<i16>,
    pub max_amplitude: i16,
    pub min_amplitude: i16,
    pub wav_bytes: Vec<u8>,
    pub em_address: String,
    pub em_address_ssrc: String,
    pub lose_time: DateTime<Utc>,
}

impl Packet {
    pub fn parse(em_host: IpAddr, em_port: u16, data: &[u8]) -> CallsonicResult<Packet> {
        let rtp = RtpReader::new(data).map_err(WrappedRtpError)?;

        let payload = rtp.payload().to_vec();
        if payload.len() % 2 != 0 {
            return Err(CallsonicError::MalformedPayload(payload.len()));
        }

        let amplitudes: Vec<i16> = payload
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect();
        let max_amplitude = amplitudes.iter().copied().max().unwrap_or(0);
        let min_amplitude = amplitudes.iter().copied().min().unwrap_or(0);

        // big-endian to little-endian for the later WAV write
        let wav_bytes = amplitudes
            .iter()
            .flat_map(|amp| amp.to_le_bytes())
            .collect();

        let ssrc = rtp.ssrc();
        let em_address = format!("{em_host}:{em_port}");
        let em_address_ssrc = format!("{ssrc}@{em_host}:{em_port}");

        Ok(Packet {
            em_host,
            em_port,
            csrc_count: rtp.csrc_count(),
            payload_type: rtp.payload_type(),
            seq_num: rtp.sequence_number().into(),
            timestamp: rtp.timestamp(),
            ssrc,
            payload,
            amplitudes,
            max_amplitude,
            min_amplitude,
            wav_bytes,
            em_address,
            em_address_ssrc,
            lose_time: Utc::now() + Duration::seconds(LOSE_AFTER_SECONDS),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn parses_bare_rtp() {
        let data: Vec<u8> = vec![
            0x80, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34,
            0x56, 0x78,
        ];
        let packet = Packet::parse(host(), 4000, &data).expect("valid rtp");

        assert_eq!(packet.csrc_count, 0);
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.seq_num, 42);
        assert_eq!(packet.ssrc, 0xDEADBEEF);
        assert_eq!(packet.payload, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(packet.amplitudes, vec![0x1234, 0x5678]);
        assert_eq!(packet.max_amplitude, 22136);
        assert_eq!(packet.min_amplitude, 4660);
        assert_eq!(packet.em_address, "10.0.0.1:4000");
        assert_eq!(packet.em_address_ssrc, "3735928559@10.0.0.1:4000");
    }

    #[test]
    fn payload_starts_after_all_csrcs() {
        // CC = 15 moves the payload to byte 12 + 60 = 72
        let mut data = vec![0x8F, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        data.extend(std::iter::repeat(0u8).take(60));
        data.extend([0x12, 0x34]);
        let packet = Packet::parse(host(), 4000, &data).expect("valid rtp");

        assert_eq!(packet.csrc_count, 15);
        assert_eq!(packet.amplitudes, vec![0x1234]);
    }

    #[test]
    fn short_datagram_is_rejected() {
        let data = vec![0x80, 0x00, 0x00];
        assert!(Packet::parse(host(), 4000, &data).is_err());
    }

    #[test]
    fn odd_payload_is_rejected() {
        let mut data = vec![0x80, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        data.extend([0x12, 0x34, 0x56]);
        assert!(matches!(
            Packet::parse(host(), 4000, &data),
            Err(CallsonicError::MalformedPayload(3))
        ));
    }

    #[test]
    fn wav_bytes_round_trip() {
        let data: Vec<u8> = vec![
            0x80, 0x00, 0x00, 0x2A, 0, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34, 0xFE, 0xDC,
        ];
        let packet = Packet::parse(host(), 4000, &data).expect("valid rtp");

        let restored: Vec<i16> = packet
            .wav_bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(restored, packet.amplitudes);
    }
}
