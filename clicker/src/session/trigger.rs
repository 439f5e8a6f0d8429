// One-shot click: GET /api/<id>/click
// No session state and no retry; the outcome goes straight back to the caller.

use crate::session::channel::Endpoint;
use crate::session::error::SessionError;
use crate::session::protocol::ChannelId;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TriggerClient {
    endpoint: Endpoint,
    http: reqwest::Client,
}

impl TriggerClient {
    pub fn new(endpoint: Endpoint) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { endpoint, http }
    }

    /// Fire one click on `channel_id`. Any 2xx is success; every other status
    /// and every transport error is a TriggerFailure.
    pub async fn send(&self, channel_id: &ChannelId) -> Result<(), SessionError> {
        let failure = |reason: String| SessionError::TriggerFailure {
            channel_id: channel_id.to_string(),
            reason,
        };

        let url = self
            .endpoint
            .click_url(channel_id)
            .map_err(|e| failure(format!("invalid click url: {}", e)))?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(channel = %channel_id, %status, "clicked");
            Ok(())
        } else {
            Err(failure(format!("server answered {}", status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_trigger_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = TriggerClient::new(Endpoint::new(format!("127.0.0.1:{}", port), false));

        let err = client
            .send(&ChannelId::new("abc").unwrap())
            .await
            .unwrap_err();
        match err {
            SessionError::TriggerFailure { channel_id, .. } => assert_eq!(channel_id, "abc"),
            other => panic!("expected TriggerFailure, got {:?}", other),
        }
    }
}
