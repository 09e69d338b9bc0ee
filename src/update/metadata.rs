use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::error::MetadataFetchError;
use super::transport::HttpClient;

/// Small JSON document published next to each release
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub version: String,
    #[serde(default)]
    pub changelog: String,
}

/// Fetch the latest release descriptor
pub fn fetch_latest(
    http: &dyn HttpClient,
    url: &str,
    timeout: Duration,
) -> Result<ReleaseDescriptor, MetadataFetchError> {
    debug!(url, "fetching release descriptor");
    let mut response = http.get(url, timeout)?;

    if response.status != 200 {
        return Err(MetadataFetchError::Status(response.status));
    }

    let mut body = Vec::new();
    response.body.read_to_end(&mut body)?;

    let descriptor: ReleaseDescriptor = serde_json::from_slice(&body)?;
    debug!(version = %descriptor.version, "release descriptor received");
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::testing::FakeHttp;

    const URL: &str = "https://updates.example/version.json";

    #[test]
    fn test_fetch_latest() {
        let http = FakeHttp::new().route(
            URL,
            200,
            br#"{"version": "1.2.0", "changelog": "Faster OCR"}"#.to_vec(),
        );
        let release = fetch_latest(&http, URL, Duration::from_secs(10)).unwrap();
        assert_eq!(release.version, "1.2.0");
        assert_eq!(release.changelog, "Faster OCR");
    }

    #[test]
    fn test_changelog_optional() {
        let http = FakeHttp::new().route(URL, 200, br#"{"version": "2.0"}"#.to_vec());
        let release = fetch_latest(&http, URL, Duration::from_secs(10)).unwrap();
        assert_eq!(release.changelog, "");
    }

    #[test]
    fn test_non_200_status() {
        let http = FakeHttp::new().route(URL, 404, b"not found".to_vec());
        let err = fetch_latest(&http, URL, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, MetadataFetchError::Status(404)));
    }

    #[test]
    fn test_malformed_json() {
        let http = FakeHttp::new().route(URL, 200, b"<html>".to_vec());
        let err = fetch_latest(&http, URL, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, MetadataFetchError::Parse(_)));
    }

    #[test]
    fn test_unreachable_server() {
        let http = FakeHttp::new();
        let err = fetch_latest(&http, URL, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, MetadataFetchError::Transport(_)));
    }
}
