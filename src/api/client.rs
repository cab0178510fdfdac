//! Control API client used by the `share` subcommand.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manager::ShareStatus;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for a share manager's control API.
#[derive(Debug, Clone)]
pub struct ShareClient {
    base_url: String,
    http: Client,
}

impl ShareClient {
    /// `base_url` like `http://10.0.0.5:9600`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn share_url(&self, volume: &str) -> String {
        format!("{}/v1/shares/{}", self.base_url, urlencoding::encode(volume))
    }

    async fn status_request(&self, method: Method, volume: &str) -> Result<ShareStatus> {
        let url = self.share_url(volume);
        debug!(%method, url = %url, "Control API request");
        let response = self
            .http
            .request(method, &url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        decode(response, volume).await
    }

    pub async fn create(&self, volume: &str) -> Result<ShareStatus> {
        self.status_request(Method::POST, volume).await
    }

    pub async fn delete(&self, volume: &str) -> Result<ShareStatus> {
        self.status_request(Method::DELETE, volume).await
    }

    pub async fn get(&self, volume: &str) -> Result<ShareStatus> {
        self.status_request(Method::GET, volume).await
    }

    pub async fn list(&self) -> Result<Vec<ShareStatus>> {
        let response = self
            .http
            .get(format!("{}/v1/shares", self.base_url))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response, "").await);
        }
        Ok(response.json().await?)
    }

    /// Stream status updates to `on_status` until the server closes the
    /// stream or `on_status` returns false.
    pub async fn watch<F>(&self, mut on_status: F) -> Result<()>
    where
        F: FnMut(ShareStatus) -> bool,
    {
        let mut response = self
            .http
            .get(format!("{}/v1/watch", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response, "").await);
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);
            for status in drain_lines(&mut buffer)? {
                if !on_status(status) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Split complete NDJSON lines off the front of `buffer`.
fn drain_lines(buffer: &mut Vec<u8>) -> Result<Vec<ShareStatus>> {
    let mut statuses = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let status = serde_json::from_slice(line)
            .map_err(|e| Error::Internal(format!("invalid status line from watch: {}", e)))?;
        statuses.push(status);
    }
    Ok(statuses)
}

async fn decode(response: reqwest::Response, volume: &str) -> Result<ShareStatus> {
    if response.status().is_success() {
        return Ok(response.json().await?);
    }
    Err(api_error(response, volume).await)
}

async fn api_error(response: reqwest::Response, volume: &str) -> Error {
    let status = response.status();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    if status == StatusCode::NOT_FOUND && !volume.is_empty() {
        return Error::Export {
            volume: volume.to_string(),
            reason: message,
        };
    }
    Error::Internal(format!("control API returned {}: {}", status, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ShareState;

    #[test]
    fn test_share_url_encodes_volume() {
        let client = ShareClient::new("http://127.0.0.1:9600/").unwrap();
        assert_eq!(
            client.share_url("vol a"),
            "http://127.0.0.1:9600/v1/shares/vol%20a"
        );
    }

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut buffer = b"{\"volume\":\"vol-a\",\"exportId\":1,\"state\":\"Ready\"}\n\n{\"volume\":\"vol-a\",".to_vec();
        let statuses = drain_lines(&mut buffer).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, ShareState::Ready);
        assert_eq!(buffer, b"{\"volume\":\"vol-a\",".to_vec());

        buffer.extend_from_slice(b"\"exportId\":0,\"state\":\"Deleted\"}\n");
        let statuses = drain_lines(&mut buffer).unwrap();
        assert_eq!(statuses[0].state, ShareState::Deleted);
        assert!(buffer.is_empty());
    }
}
