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

//! Outbound HTTP client for the call-control service. Requests retry with a
//! linear backoff (attempt index in seconds) and carry a request identity
//! header so the peer can deduplicate.

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status codes the peer may answer without the request counting as failed.
const ACCEPTED_HTTP_CODES: [u16; 4] = [200, 201, 204, 404];

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub attempts: usize,
    pub duration_warning: Duration,
    pub api_id: String,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            timeout: Duration::from_secs(10),
            attempts: 3,
            duration_warning: Duration::from_secs(1),
            api_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub http_code: u16,
    pub net_status: bool,
    pub success: bool,
    pub message: String,
    pub result: Option<Value>,
    pub used_attempts: usize,
    pub execute_time: Duration,
}

pub struct CallbackClient {
    host: String,
    port: u16,
    client: reqwest::Client,
}

impl CallbackClient {
    pub fn new(host: impl Into<String>, port: u16) -> CallbackClient {
        CallbackClient {
            host: host.into(),
            port,
            client: reqwest::Client::new(),
        }
    }

    pub fn url_api(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub async fn check_diag(&self) -> bool {
        let request = ApiRequest::new(Method::GET, format!("{}/diag", self.url_api()));
        let response = self.send(request).await;
        debug!(
            "diag probe of {} answered http_code={}",
            self.url_api(),
            response.http_code
        );
        response.success
    }

    /// Notify the call-control service that a template matched on a channel.
    pub async fn send_detection(
        &self,
        chan_id: &str,
        call_id: &str,
        template_name: &str,
        match_count: usize,
    ) -> ApiResponse {
        let body = serde_json::json!({
            "event_name": "DETECTION",
            "chan_id": chan_id,
            "call_id": call_id,
            "template_name": template_name,
            "match_count": match_count,
            "send_time": Utc::now().to_rfc3339(),
        });
        let request =
            ApiRequest::new(Method::POST, format!("{}/events", self.url_api())).with_body(body);
        self.send(request).await
    }

    pub async fn send(&self, api_request: ApiRequest) -> ApiResponse {
        let start = Instant::now();
        let mut api_response = ApiResponse::default();

        for attempt in 0..api_request.attempts.max(1) {
            api_response.used_attempts = attempt;
            if attempt > 0 {
                info!("retrying request {} to {}", api_request.api_id, api_request.url);
            }

            let mut builder = self
                .client
                .request(api_request.method.clone(), &api_request.url)
                .timeout(api_request.timeout)
                .header("x-api-id", &api_request.api_id)
                .header(
                    "x-duration-warning",
                    api_request.duration_warning.as_secs().to_string(),
                );
            if let Some(body) = &api_request.body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    api_response.http_code = response.status().as_u16();
                    api_response.message = format!("http_code {}", api_response.http_code);
                    api_response.result = response.json().await.ok();
                    api_response.execute_time = start.elapsed();

                    if let Some(message) = api_response
                        .result
                        .as_ref()
                        .and_then(|it| it.get("message").or_else(|| it.get("msg")))
                        .and_then(Value::as_str)
                    {
                        api_response.message = message.to_owned();
                    }

                    if ACCEPTED_HTTP_CODES.contains(&api_response.http_code) {
                        api_response.net_status = true;
                        api_response.success = !result_reports_error(&api_response.result);
                        break;
                    }

                    warn!(
                        "request {} to {} answered http_code={}",
                        api_request.api_id, api_request.url, api_response.http_code
                    );
                }
                Err(e) => {
                    api_response.execute_time = start.elapsed();
                    if attempt == 0 {
                        warn!("request {} to {} failed: {e}", api_request.api_id, api_request.url);
                    } else {
                        warn!(
                            "request {} to {} failed on attempt {attempt}: {e}",
                            api_request.api_id, api_request.url
                        );
                    }
                }
            }

            sleep(Duration::from_secs(attempt as u64)).await;
        }

        if api_response.execute_time > api_request.duration_warning {
            warn!(
                "request {} to {} took {:?}",
                api_request.api_id, api_request.url, api_response.execute_time
            );
        }

        api_response
    }
}

fn result_reports_error(result: &Option<Value>) -> bool {
    let Some(result) = result else {
        return false;
    };
    for key in ["res", "status"] {
        if let Some(value) = result.get(key).and_then(Value::as_str) {
            if value.eq_ignore_ascii_case("error") {
                return true;
            }
        }
    }
    false
}
