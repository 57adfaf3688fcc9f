//! Audio source acquisition
//!
//! Resolves an opaque source URL to bytes: `data:` URIs (base64 or
//! percent-free plain payloads), `http(s)://` via reqwest, and `file://` or
//! bare filesystem paths.

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;

/// Errors while fetching or decoding a source
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("Malformed data URI: {0}")]
    InvalidDataUri(String),
    #[error("Failed to read audio file: {0}")]
    Io(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status} fetching audio")]
    Http { status: u16 },
    #[error("Failed to decode audio: {0}")]
    Decode(String),
}

/// Where a source URL points
#[derive(Debug, Clone, PartialEq)]
pub enum SourceLocation {
    Data { mime_type: String, base64: bool, payload: String },
    Remote(String),
    File(PathBuf),
}

impl SourceLocation {
    pub fn parse(url: &str) -> Result<Self, SourceError> {
        if let Some(rest) = url.strip_prefix("data:") {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| SourceError::InvalidDataUri("missing ','".to_string()))?;
            let base64 = header.ends_with(";base64");
            let mime_type = header
                .split(';')
                .next()
                .filter(|m| !m.is_empty())
                .unwrap_or("text/plain")
                .to_string();
            return Ok(Self::Data {
                mime_type,
                base64,
                payload: payload.to_string(),
            });
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Self::Remote(url.to_string()));
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        Ok(Self::File(PathBuf::from(path)))
    }
}

/// Fetches source bytes; one HTTP client shared per loader
#[derive(Debug, Clone)]
pub struct SourceLoader {
    client: Client,
}

impl SourceLoader {
    pub fn new() -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        match SourceLocation::parse(url)? {
            SourceLocation::Data { base64, payload, .. } => {
                if base64 {
                    STANDARD
                        .decode(payload.trim())
                        .map_err(|e| SourceError::InvalidDataUri(e.to_string()))
                } else {
                    Ok(payload.into_bytes())
                }
            }
            SourceLocation::Remote(url) => {
                log::debug!("SourceLoader: fetching {}", url);
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| SourceError::Network(e.to_string()))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::Http {
                        status: status.as_u16(),
                    });
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| SourceError::Network(e.to_string()))?;
                Ok(bytes.to_vec())
            }
            SourceLocation::File(path) => tokio::fs::read(&path)
                .await
                .map_err(|e| SourceError::Io(format!("{}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            SourceLocation::parse("data:audio/wav;base64,AAAA").unwrap(),
            SourceLocation::Data {
                mime_type: "audio/wav".to_string(),
                base64: true,
                payload: "AAAA".to_string(),
            }
        );
        assert_eq!(
            SourceLocation::parse("https://cdn.example.com/a.wav").unwrap(),
            SourceLocation::Remote("https://cdn.example.com/a.wav".to_string())
        );
        assert_eq!(
            SourceLocation::parse("file:///tmp/a.wav").unwrap(),
            SourceLocation::File(PathBuf::from("/tmp/a.wav"))
        );
        assert_eq!(
            SourceLocation::parse("clips/a.wav").unwrap(),
            SourceLocation::File(PathBuf::from("clips/a.wav"))
        );
        assert!(SourceLocation::parse("data:audio/wav;base64").is_err());
    }

    #[tokio::test]
    async fn test_fetch_data_uri() {
        let loader = SourceLoader::new().unwrap();
        let bytes = loader.fetch("data:audio/wav;base64,AQID").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        let bytes = loader.fetch("data:,hi").await.unwrap();
        assert_eq!(bytes, b"hi".to_vec());
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, [9u8, 8, 7]).unwrap();

        let loader = SourceLoader::new().unwrap();
        let url = format!("file://{}", path.display());
        assert_eq!(loader.fetch(&url).await.unwrap(), vec![9, 8, 7]);

        let missing = dir.path().join("missing.wav");
        let err = loader.fetch(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, SourceError::Io(_)));
    }

    #[tokio::test]
    async fn test_bad_base64() {
        let loader = SourceLoader::new().unwrap();
        let err = loader.fetch("data:audio/wav;base64,@@@").await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidDataUri(_)));
    }
}
