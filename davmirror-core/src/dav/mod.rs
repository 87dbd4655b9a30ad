//! WebDAV adapter: thin typed wrappers over the handful of verbs the
//! sync engine needs, with a shared retry policy for throttling servers.

mod crawler;
mod xml;

pub use crawler::{CrawlTree, TreeCrawler};
pub use xml::{DavEntry, MultistatusError, normalize_etag, parse_http_date, parse_multistatus};

use std::time::Duration;

use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use thiserror::Error;
use url::Url;

const PROPFIND_BODY: &str = "<d:propfind xmlns:d='DAV:'><d:allprop/></d:propfind>";
const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid dav url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{method} {path} returned {status}")]
    Status {
        method: &'static str,
        path: String,
        status: StatusCode,
    },
    #[error("multistatus parse error: {0}")]
    Multistatus(#[from] MultistatusError),
}

#[derive(Debug, Clone, Default)]
pub struct DavOptions {
    pub dav_uri: String,
    pub auth_token: String,
    /// Authorization scheme used with `auth_token`; `OAuth` when empty.
    pub auth_token_type: String,
    pub auth_user: String,
    pub auth_pass: String,
    pub retry_limit: u32,
    pub retry_delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    Infinity,
}

impl Depth {
    fn header(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::Infinity => "infinity",
        }
    }
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base: Url,
    options: DavOptions,
    retry_limit: u32,
    retry_delay: Duration,
}

impl DavClient {
    pub fn new(options: DavOptions) -> Result<Self, DavError> {
        let base = Url::parse(&options.dav_uri)?;
        let retry_limit = if options.retry_limit == 0 {
            DEFAULT_RETRY_LIMIT
        } else {
            options.retry_limit
        };
        let retry_delay = options.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
        Ok(Self {
            http: Client::new(),
            base,
            options,
            retry_limit,
            retry_delay,
        })
    }

    /// `PROPFIND` at a backend-absolute path. `None` means 404.
    pub async fn propfind(
        &self,
        abs_path: &str,
        depth: Depth,
    ) -> Result<Option<Vec<DavEntry>>, DavError> {
        let method = Method::from_bytes(b"PROPFIND").expect("static method name");
        let builder = self
            .request(method, abs_path)
            .header("Depth", depth.header())
            .header("Content-Type", "application/xml;charset=UTF-8")
            .body(PROPFIND_BODY);
        let response = self.send_with_retry(builder, abs_path).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::MULTI_STATUS | StatusCode::OK => {
                let body = response.text().await?;
                Ok(Some(parse_multistatus(&body)?))
            }
            status => Err(DavError::Status {
                method: "PROPFIND",
                path: abs_path.to_string(),
                status,
            }),
        }
    }

    /// `MKCOL`. The raw status is returned so callers can treat
    /// already-exists answers (405/409) as success.
    pub async fn mkcol(&self, abs_path: &str) -> Result<StatusCode, DavError> {
        let method = Method::from_bytes(b"MKCOL").expect("static method name");
        let response = self
            .send_with_retry(self.request(method, abs_path), abs_path)
            .await?;
        Ok(response.status())
    }

    /// `GET` a file; the body is streamed by the caller.
    pub async fn get(&self, abs_path: &str) -> Result<reqwest::Response, DavError> {
        let response = self
            .send_with_retry(self.request(Method::GET, abs_path), abs_path)
            .await?;
        if response.status() == StatusCode::OK {
            Ok(response)
        } else {
            Err(DavError::Status {
                method: "GET",
                path: abs_path.to_string(),
                status: response.status(),
            })
        }
    }

    /// `PUT` a streaming body. `size > 0` pins `Content-Length`.
    pub async fn put(&self, abs_path: &str, body: reqwest::Body, size: i64) -> Result<(), DavError> {
        let mut builder = self.request(Method::PUT, abs_path).body(body);
        if size > 0 {
            builder = builder.header(CONTENT_LENGTH, size);
        }
        // streaming bodies cannot be replayed, so no retry here
        let response = builder.send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(DavError::Status {
                method: "PUT",
                path: abs_path.to_string(),
                status,
            }),
        }
    }

    /// `MOVE` with an absolute `Destination`, overwriting.
    pub async fn move_resource(&self, src_abs: &str, dst_abs: &str) -> Result<(), DavError> {
        let method = Method::from_bytes(b"MOVE").expect("static method name");
        let destination = self.endpoint(dst_abs).to_string();
        let builder = self
            .request(method, src_abs)
            .header("Destination", destination)
            .header("Overwrite", "T");
        let response = self.send_with_retry(builder, src_abs).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DavError::Status {
                method: "MOVE",
                path: src_abs.to_string(),
                status: response.status(),
            })
        }
    }

    /// `DELETE`.
    pub async fn delete_resource(&self, abs_path: &str) -> Result<(), DavError> {
        let response = self
            .send_with_retry(self.request(Method::DELETE, abs_path), abs_path)
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DavError::Status {
                method: "DELETE",
                path: abs_path.to_string(),
                status: response.status(),
            })
        }
    }

    fn endpoint(&self, abs_path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            abs_path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }

    fn request(&self, method: Method, abs_path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, self.endpoint(abs_path))
            .header("Accept", "application/xml,text/xml")
            .header("Accept-Charset", "utf-8");
        if !self.options.auth_token.is_empty() {
            let scheme = if self.options.auth_token_type.is_empty() {
                "OAuth"
            } else {
                &self.options.auth_token_type
            };
            builder.header(
                "Authorization",
                format!("{scheme} {}", self.options.auth_token),
            )
        } else {
            builder.basic_auth(&self.options.auth_user, Some(&self.options.auth_pass))
        }
    }

    /// Replays the request on transport errors and 429, up to the
    /// configured limit. The last throttled response or error is
    /// surfaced when every attempt is rejected.
    async fn send_with_retry(
        &self,
        builder: RequestBuilder,
        abs_path: &str,
    ) -> Result<reqwest::Response, DavError> {
        let mut last_response: Option<reqwest::Response> = None;
        let mut last_error: Option<reqwest::Error> = None;
        for attempt in 0..self.retry_limit {
            let Some(request) = builder.try_clone() else {
                break;
            };
            match request.send().await {
                Ok(response) => {
                    if response.status() == StatusCode::TOO_MANY_REQUESTS
                        && attempt + 1 < self.retry_limit
                    {
                        tracing::debug!(path = %abs_path, attempt, "dav endpoint throttled");
                        last_response = Some(response);
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => last_error = Some(err),
            }
        }
        if let Some(response) = last_response {
            return Ok(response);
        }
        if let Some(err) = last_error {
            return Err(err.into());
        }
        // non-replayable body: single shot
        Ok(builder.send().await?)
    }
}
