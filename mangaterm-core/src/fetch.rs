use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::Client;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unsupported resource identifier {0:?}")]
    Unsupported(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Retrieves the raw bytes behind a page resource identifier.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, resource: &str) -> Result<Bytes, FetchError>;
}

/// Blocking HTTP(S) fetcher that also understands `file://` identifiers.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub const USER_AGENT: &'static str = "Mozilla/5.0 (Linux; Android 4.4.2) AppleWebKit/537.36 \
         (KHTML, like Gecko) Version/4.0 Chrome/30.0.0.0 Safari/537.36";

    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(Self::USER_AGENT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    fn fetch_http(&self, url: Url) -> Result<Bytes, FetchError> {
        let rendered = url.to_string();
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Transport {
                url: rendered.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: rendered,
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map_err(|source| FetchError::Transport {
                url: rendered,
                source,
            })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, resource: &str) -> Result<Bytes, FetchError> {
        let url = Url::parse(resource).map_err(|_| FetchError::Unsupported(resource.to_owned()))?;
        match url.scheme() {
            "http" | "https" => self.fetch_http(url),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| FetchError::Unsupported(resource.to_owned()))?;
                fs::read(&path)
                    .map(Bytes::from)
                    .map_err(|source| FetchError::Io { path, source })
            }
            _ => Err(FetchError::Unsupported(resource.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn reads_file_urls_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("001.png");
        fs::write(&path, b"\x89PNG fake").unwrap();
        let url = Url::from_file_path(&path).unwrap();

        let bytes = fetcher().fetch(url.as_str()).unwrap();
        assert_eq!(&bytes[..], b"\x89PNG fake");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("missing.png")).unwrap();
        assert!(matches!(
            fetcher().fetch(url.as_str()),
            Err(FetchError::Io { .. })
        ));
    }

    #[test]
    fn rejects_unknown_schemes_and_garbage() {
        assert!(matches!(
            fetcher().fetch("ftp://example.com/a.png"),
            Err(FetchError::Unsupported(_))
        ));
        assert!(matches!(
            fetcher().fetch("not a url"),
            Err(FetchError::Unsupported(_))
        ));
    }
}
