use std::io::{self, Read};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;

/// An opened remote resource: status line, advertised length and body.
pub struct RemoteStream {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl RemoteStream {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where artifact bytes come from. The downloader only needs "open a byte
/// stream for this URL"; everything transport specific stays behind this.
pub trait ByteSource: Send + Sync {
    fn open(&self, url: &str) -> io::Result<RemoteStream>;
}

pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            // blocking clients default to a 30s total timeout; artifacts take longer
            .timeout(Option::<Duration>::None)
            .build()
            .context("create http client")?;
        Ok(Self { client })
    }
}

impl ByteSource for HttpSource {
    fn open(&self, url: &str) -> io::Result<RemoteStream> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(RemoteStream {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}
