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

//! callsonic detects pre-recorded audio fragments (answering-machine
//! prompts, IVR beeps, voicemail greetings) in live telephony RTP streams.
//! Calls are announced on an HTTP control plane, their RTP flows arrive on a
//! UDP port, and every call's audio timeline is continuously fingerprinted
//! and matched against a WAV template library.

pub mod app;
pub mod client;
pub mod config;
pub mod container;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod lifecycle;
pub mod packet;
pub mod receiver;
pub mod telemetry;
pub mod template;
pub mod webserver;

#[cfg(test)]
pub(crate) mod testutil;
