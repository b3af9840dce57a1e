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

use axum::{http::StatusCode, response::IntoResponse};
use miette::Diagnostic;
use rtp_rs::RtpReaderError;
use std::{fmt::Display, io};
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinError};
use tracing_subscriber::{filter::ParseError, util::TryInitError};

#[derive(Error, Debug, Diagnostic)]
pub enum CallsonicError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("Tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
    #[error("Tracing config parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("API error.")]
    ApiError(#[from] oneshot::error::RecvError),
    #[error("Worker task error: {0}")]
    JoinError(#[from] JoinError),
    #[error("HTTP request error: {0}")]
    HttpRequestError(#[from] reqwest::Error),
    #[error("WAV error: {0}")]
    WavError(#[from] hound::Error),
    #[error("FFT error: {0}")]
    FftError(#[from] realfft::FftError),
    #[error("Image error: {0}")]
    ImageError(#[from] image::error::ImageError),
    #[error("Timestamp parse error: {0}")]
    TimeParseError(#[from] chrono::ParseError),
    #[error("Received invalid RTP data: {0:?}")]
    InvalidRtpData(#[from] WrappedRtpError),
    #[error("RTP payload is not 16-bit aligned: {0} bytes")]
    MalformedPayload(usize),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Invalid event payload: {0}")]
    InvalidEvent(String),
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Template error: {0}")]
    TemplateError(String),
    #[error("General error: {0}")]
    Other(String),
}

#[derive(Error, Debug, Diagnostic)]
pub struct WrappedRtpError(pub RtpReaderError);

impl Display for WrappedRtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl IntoResponse for CallsonicError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            CallsonicError::UnknownEvent(_) | CallsonicError::UnknownChannel(_) => {
                StatusCode::NOT_FOUND
            }
            CallsonicError::InvalidEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("{self}")).into_response()
    }
}

pub type CallsonicResult<T> = Result<T, CallsonicError>;
