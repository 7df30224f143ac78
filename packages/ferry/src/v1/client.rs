//! HTTP client for the ferry v1 API.
//!
//! The same client type talks to both halves of the distributed build: the
//! shared content store (blob and descriptor endpoints) and the orchestrator
//! (attach, work, result, heartbeat, bye endpoints). Which half a deployment
//! actually serves is up to it; the paths don't overlap.

use std::sync::Arc;

use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use futures::TryStreamExt;
use reqwest::{Response, StatusCode};
use tap::Pipe;
use tokio::io::{AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::instrument;
use url::Url;

use crate::{
    ContentType, Token,
    v1::{
        Digest, GraphDescriptor,
        distrib::{
            AttachRequest, AttachResponse, Bye, Heartbeat, PipResult, WorkPollResponse, WorkerId,
        },
        store::{ProbeGraphRequest, ProbeGraphResponse, ProbeKind, RegisterGraphRequest},
    },
};

/// Maximum decompressed size for individual blob decompression (1GB).
///
/// This limit applies per blob; it does not bound the total across a build,
/// only the size of each decompressed blob.
const MAX_DECOMPRESSED_SIZE: usize = 1024 * 1024 * 1024;

/// Client for the ferry API.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct Client {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::Client,

    token: Token,
}

impl Client {
    /// Create a new client with the given base URL and authentication token.
    pub fn new(base: Url, token: Token) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("build http client")?;

        Ok(Self {
            base: Arc::new(base),
            http,
            token,
        })
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let url = self.base.join("api/v1/health")?;
        let response = self.http.get(url).send().await.context("request")?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Check if a blob exists in the content store.
    #[instrument(skip(self))]
    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.base.join(&format!("api/v1/blob/{digest}"))?;
        let response = self
            .http
            .head(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Read a blob from the content store.
    #[instrument(skip(self))]
    pub async fn blob_read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let url = self.base.join(&format!("api/v1/blob/{digest}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .header(ContentType::ACCEPT, ContentType::BytesZstd.value())
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => {
                let reader = response
                    .bytes_stream()
                    .map_err(std::io::Error::other)
                    .pipe(StreamReader::new)
                    .pipe(BufReader::new)
                    .pipe(ZstdDecoder::new);
                let mut buffer = Vec::new();
                reader
                    .take(MAX_DECOMPRESSED_SIZE as u64)
                    .read_to_end(&mut buffer)
                    .await
                    .context("read decompressed blob")?;
                Ok(Some(buffer))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Write a blob to the content store.
    ///
    /// Returns `true` if the blob was newly written, `false` if the store
    /// already had it.
    #[instrument(skip(self, content))]
    pub async fn blob_write(&self, digest: &Digest, content: &[u8]) -> Result<bool> {
        let url = self.base.join(&format!("api/v1/blob/{digest}"))?;
        let mut encoder = ZstdEncoder::new(BufReader::new(content));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .await
            .context("compress blob")?;

        let response = self
            .http
            .put(url)
            .bearer_auth(self.token.expose())
            .header(ContentType::HEADER, ContentType::BytesZstd.value())
            .body(compressed)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::OK => Ok(false),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Register a graph descriptor under its fingerprints.
    #[instrument(skip_all, fields(fingerprint = %descriptor.exact_fingerprint))]
    pub async fn register_graph(&self, descriptor: &GraphDescriptor) -> Result<()> {
        let url = self.base.join("api/v1/graph/register")?;
        let body = RegisterGraphRequest::builder()
            .descriptor(descriptor.clone())
            .build();
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(&body)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Probe for graph descriptors by fingerprint.
    #[instrument(skip(self))]
    pub async fn probe_graph(
        &self,
        fingerprint: &Digest,
        kind: ProbeKind,
    ) -> Result<Vec<GraphDescriptor>> {
        let url = self.base.join("api/v1/graph/probe")?;
        let body = ProbeGraphRequest::builder()
            .fingerprint(fingerprint.clone())
            .kind(kind)
            .build();
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(&body)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => response
                .json::<ProbeGraphResponse>()
                .await
                .context("parse JSON response")?
                .candidates
                .pipe(Ok),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Attach to the orchestrator as a worker.
    #[instrument(skip_all, fields(worker_id = %request.worker_id))]
    pub async fn attach(&self, request: &AttachRequest) -> Result<AttachResponse> {
        let url = self.base.join("api/v1/attach")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(request)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => response
                .json::<AttachResponse>()
                .await
                .context("parse JSON response"),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Poll the orchestrator for dispatched work.
    #[instrument(skip(self))]
    pub async fn poll_work(&self, worker_id: &WorkerId) -> Result<WorkPollResponse> {
        let url = self.base.join(&format!("api/v1/work/{worker_id}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => response
                .json::<WorkPollResponse>()
                .await
                .context("parse JSON response"),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Post the result of a dispatched pip.
    ///
    /// Returns `true` if the orchestrator accepted the result, `false` if it
    /// dropped it (stale sequence number).
    #[instrument(skip_all, fields(worker_id = %worker_id, seq = %result.seq))]
    pub async fn post_result(&self, worker_id: &WorkerId, result: &PipResult) -> Result<bool> {
        let url = self.base.join(&format!("api/v1/result/{worker_id}"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(result)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Send a liveness heartbeat.
    #[instrument(skip_all, fields(worker_id = %worker_id))]
    pub async fn heartbeat(&self, worker_id: &WorkerId, heartbeat: &Heartbeat) -> Result<()> {
        let url = self.base.join(&format!("api/v1/heartbeat/{worker_id}"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(heartbeat)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Tell the orchestrator the worker is leaving.
    #[instrument(skip_all, fields(worker_id = %worker_id))]
    pub async fn bye(&self, worker_id: &WorkerId, bye: &Bye) -> Result<()> {
        let url = self.base.join(&format!("api/v1/bye/{worker_id}"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(bye)
            .send()
            .await
            .context("send")?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }
}

/// Build the error report for an unexpected status code, attaching the URL,
/// response body, and request id so users can correlate with server logs.
async fn unexpected_status(status: StatusCode, response: Response) -> color_eyre::Report {
    let url = response.url().to_string();
    let request_id = request_id(&response);
    let body = response.text().await.unwrap_or_default();
    eyre!("unexpected status code: {status}")
        .with_section(|| url.header("Url:"))
        .with_section(|| body.header("Body:"))
        .with_section(|| request_id.header("Request ID:"))
}

/// Extract the request id from a response, if the server provided one.
fn request_id(response: &Response) -> String {
    response
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("<none>")
        .to_string()
}
