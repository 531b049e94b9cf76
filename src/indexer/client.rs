// src/indexer/client.rs

//! Conditional fetches of channel metadata

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::IF_MODIFIED_SINCE;
use std::time::Duration;
use tracing::debug;

/// Timeout for a single metadata download
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of a conditional GET
#[derive(Debug)]
pub enum Fetched {
    /// 304: unchanged since the given instant
    NotModified,
    /// 404: the channel does not publish this document
    Missing,
    Body(Vec<u8>),
}

/// HTTP-date form used by `If-Modified-Since`
pub fn http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Clone)]
pub struct ChannelClient {
    http: reqwest::Client,
}

impl ChannelClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// GET `url`, conditional on `since` when given
    pub async fn fetch(&self, url: &str, since: Option<DateTime<Utc>>) -> Result<Fetched> {
        let mut request = self.http.get(url).timeout(FETCH_TIMEOUT);
        if let Some(since) = since {
            request = request.header(IF_MODIFIED_SINCE, http_date(since));
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("{} not modified", url);
                Ok(Fetched::NotModified)
            }
            StatusCode::NOT_FOUND => {
                debug!("{} not found", url);
                Ok(Fetched::Missing)
            }
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                debug!("Fetched {} ({} bytes)", url, bytes.len());
                Ok(Fetched::Body(bytes.to_vec()))
            }
            status => Err(Error::Http(format!("HTTP {status} from {url}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_http_date() {
        let when = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(http_date(when), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}
