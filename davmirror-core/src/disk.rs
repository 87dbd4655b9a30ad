//! Cloud-disk REST API client.
//!
//! The API exposes a flat file listing, an upload handshake (ask for an
//! upload href, then `PUT` the payload to it) and path-addressed
//! move/delete/mkdir endpoints. Backend-absolute paths carry a `disk:`
//! prefix in listing responses; the client accepts plain absolute paths
//! for requests.

use std::time::Duration;

use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Single listing cap; the listing endpoint is not paginated here.
const LIST_LIMIT: u32 = 999_999;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid api url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status} for {context}: {body}")]
    Api {
        status: StatusCode,
        context: String,
        body: String,
    },
    #[error("upload href for '{path}' is templated")]
    TemplatedUpload { path: String },
}

#[derive(Debug, Clone, Default)]
pub struct DiskOptions {
    pub api_uri: String,
    pub auth_token: String,
    pub retry_limit: u32,
    pub retry_delay: Option<Duration>,
}

#[derive(Clone)]
pub struct DiskClient {
    http: Client,
    base_url: Url,
    token: String,
    retry_limit: u32,
    retry_delay: Duration,
}

impl DiskClient {
    pub fn new(options: DiskOptions) -> Result<Self, DiskError> {
        let base_url = Url::parse(options.api_uri.trim_end_matches('/'))?;
        let retry_limit = if options.retry_limit == 0 {
            DEFAULT_RETRY_LIMIT
        } else {
            options.retry_limit
        };
        Ok(Self {
            http: Client::new(),
            base_url,
            token: options.auth_token,
            retry_limit,
            retry_delay: options.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
        })
    }

    /// Flat listing of every file under the account.
    pub async fn list_files(&self) -> Result<Vec<DiskResource>, DiskError> {
        let mut url = self.endpoint("resources/files")?;
        url.query_pairs_mut()
            .append_pair("limit", &LIST_LIMIT.to_string());
        let response = self
            .send_with_retry(self.request(Method::GET, url), "list files")
            .await?;
        let listing: DiskResourceList = Self::decode(response, "list files").await?;
        Ok(listing.items)
    }

    /// Metadata for one path; `None` on 404.
    pub async fn get_resource(&self, path: &str) -> Result<Option<DiskResource>, DiskError> {
        let mut url = self.endpoint("resources")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .send_with_retry(self.request(Method::GET, url), "get resource")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::decode(response, "get resource").await?))
    }

    /// Create one directory level. Returns the raw status so callers can
    /// treat 409 (already exists) as success.
    pub async fn create_folder(&self, path: &str) -> Result<StatusCode, DiskError> {
        let mut url = self.endpoint("resources")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .send_with_retry(self.request(Method::PUT, url), "create folder")
            .await?;
        Ok(response.status())
    }

    /// First leg of the upload handshake.
    pub async fn upload_link(&self, path: &str, overwrite: bool) -> Result<TransferLink, DiskError> {
        let mut url = self.endpoint("resources/upload")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("overwrite", bool_str(overwrite));
        let response = self
            .send_with_retry(self.request(Method::GET, url), "upload link")
            .await?;
        let link: TransferLink = Self::decode(response, "upload link").await?;
        if link.templated {
            return Err(DiskError::TemplatedUpload {
                path: path.to_string(),
            });
        }
        Ok(link)
    }

    /// Second leg: stream the payload to the href from [`upload_link`].
    pub async fn upload(
        &self,
        link: &TransferLink,
        body: reqwest::Body,
        size: i64,
    ) -> Result<(), DiskError> {
        let method = Method::from_bytes(link.method.as_bytes()).unwrap_or(Method::PUT);
        let mut builder = self.http.request(method, link.href.clone()).body(body);
        if size > 0 {
            builder = builder.header(CONTENT_LENGTH, size);
        }
        let response = builder.send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            status => Err(DiskError::Api {
                status,
                context: "upload".to_string(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Plain authorized GET of a download href from the listing.
    pub async fn download(&self, href: &str) -> Result<reqwest::Response, DiskError> {
        let url = Url::parse(href)?;
        let response = self
            .send_with_retry(self.request(Method::GET, url), "download")
            .await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(DiskError::Api {
                status: response.status(),
                context: "download".to_string(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    pub async fn move_resource(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<(), DiskError> {
        let mut url = self.endpoint("resources/move")?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", path)
            .append_pair("overwrite", bool_str(overwrite));
        let response = self
            .send_with_retry(self.request(Method::POST, url), "move")
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DiskError::Api {
                status: response.status(),
                context: format!("move {from}"),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    pub async fn delete_resource(&self, path: &str, permanently: bool) -> Result<(), DiskError> {
        let mut url = self.endpoint("resources")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if permanently {
                query.append_pair("permanently", "true");
            }
        }
        let response = self
            .send_with_retry(self.request(Method::DELETE, url), "delete")
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DiskError::Api {
                status: response.status(),
                context: format!("delete {path}"),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, DiskError> {
        Ok(Url::parse(&format!("{}/{path}", self.base_url))?)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Accept", "*/*")
            .header("Authorization", format!("OAuth {}", self.token))
    }

    async fn send_with_retry(
        &self,
        builder: RequestBuilder,
        context: &str,
    ) -> Result<reqwest::Response, DiskError> {
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
                        tracing::debug!(context, attempt, "disk api throttled");
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
        Ok(builder.send().await?)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &str,
    ) -> Result<T, DiskError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(DiskError::Api {
                status: response.status(),
                context: context.to_string(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[derive(Debug, Deserialize)]
struct DiskResourceList {
    items: Vec<DiskResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskResource {
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Backend-absolute path, `disk:/...`.
    pub path: String,
    #[serde(rename = "type")]
    pub resource_type: DiskResourceType,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Download href, present for files.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskResourceType {
    File,
    Dir,
}

impl DiskResource {
    pub fn is_dir(&self) -> bool {
        self.resource_type == DiskResourceType::Dir
    }

    /// Absolute path without the `disk:` prefix, canonicalized.
    pub fn plain_abs_path(&self) -> String {
        let stripped = self.path.strip_prefix("disk:").unwrap_or(&self.path);
        crate::paths::normalize(stripped, self.is_dir())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
    #[serde(default)]
    pub templated: bool,
}
