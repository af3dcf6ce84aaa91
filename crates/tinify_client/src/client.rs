use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{header, Body, Response, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use url::Url;

use crate::ClientError;

/// Base URL of the production compression service.
pub const DEFAULT_ENDPOINT: &str = "https://api.tinify.com";

/// The service authenticates with HTTP Basic auth where the username is
/// fixed and the password is the API key.
const BASIC_AUTH_USER: &str = "api";

/// Response header carrying the number of compressions performed under
/// the authenticated key this month.
const COMPRESSION_COUNT: &str = "compression-count";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options used when constructing a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base URL of the compression service.
    pub endpoint: Url,

    /// Transport-level timeout applied to every request. There are no
    /// per-operation deadlines; callers wanting tighter bounds should
    /// cancel from the outside.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid url"),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Metadata preservation requested when downloading a compressed image.
///
/// When any flag is set the download switches from a plain GET to a POST
/// with a `{"preserve": [..]}` body, which instructs the service to copy
/// the selected metadata from the original into the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    pub preserve_copyright: bool,
    pub preserve_location: bool,
    pub preserve_creation: bool,
}

impl DownloadOptions {
    /// Whether any metadata preservation was requested.
    pub fn preserves_metadata(&self) -> bool {
        self.preserve_copyright || self.preserve_location || self.preserve_creation
    }

    fn preserve_list(&self) -> Vec<&'static str> {
        let mut preserve = Vec::new();
        if self.preserve_copyright {
            preserve.push("copyright");
        }
        if self.preserve_location {
            preserve.push("location");
        }
        if self.preserve_creation {
            preserve.push("creation");
        }
        preserve
    }
}

/// Outcome of a successful shrink request.
///
/// The compressed bytes are not part of the record; they live behind
/// [`CompressionRecord::url`] and must be fetched with
/// [`Client::download`] on the same client that produced the record,
/// since the download URL requires the same credentials.
#[derive(Debug, Clone)]
pub struct CompressionRecord {
    /// Mime type of the compressed image.
    pub mime_type: String,
    /// Size of the compressed image in bytes.
    pub size: u64,
    /// Width of the compressed image in pixels.
    pub width: u32,
    /// Height of the compressed image in pixels.
    pub height: u32,
    /// Location of the compressed bytes.
    pub url: Url,
    /// Value of the `Compression-Count` header, when the service sent it.
    pub compression_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ShrinkResponse {
    output: ShrinkOutput,
}

#[derive(Debug, Deserialize)]
struct ShrinkOutput {
    size: u64,
    #[serde(rename = "type")]
    mime_type: String,
    width: u32,
    height: u32,
    url: Url,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
    message: String,
}

/// An API-key-scoped handle to the remote compression service.
#[derive(Debug)]
pub struct Client {
    api_key: String,
    endpoint: Url,
    http: reqwest::Client,
}

impl Client {
    /// Constructs a client for the given API key.
    pub fn new(api_key: impl Into<String>, options: &ClientOptions) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(concat!("tinifier/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            api_key: api_key.into(),
            endpoint: options.endpoint.clone(),
            http,
        })
    }

    /// The API key this client authenticates with.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Streams `src` to the shrink endpoint and returns the compression
    /// outcome.
    pub async fn compress<R>(&self, src: R) -> Result<CompressionRecord, ClientError>
    where
        R: AsyncRead + Send + 'static,
    {
        let response = self
            .http
            .post(self.shrink_url())
            .basic_auth(BASIC_AUTH_USER, Some(&self.api_key))
            .header(header::ACCEPT, "application/json")
            .body(Body::wrap_stream(ReaderStream::new(src)))
            .send()
            .await?;

        let compression_count = compression_count(&response);
        if response.status() != StatusCode::CREATED {
            return Err(error_for_status(response).await);
        }

        let body = response.bytes().await?;
        let shrink: ShrinkResponse =
            serde_json::from_slice(&body).map_err(ClientError::Decode)?;

        Ok(CompressionRecord {
            mime_type: shrink.output.mime_type,
            size: shrink.output.size,
            width: shrink.output.width,
            height: shrink.output.height,
            url: shrink.output.url,
            compression_count,
        })
    }

    /// Fetches the compressed bytes of `record` into `dst`.
    pub async fn download<W>(
        &self,
        record: &CompressionRecord,
        dst: &mut W,
        options: DownloadOptions,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let request = if options.preserves_metadata() {
            self.http
                .post(record.url.clone())
                .json(&serde_json::json!({ "preserve": options.preserve_list() }))
        } else {
            self.http.get(record.url.clone())
        };

        let response = request
            .basic_auth(BASIC_AUTH_USER, Some(&self.api_key))
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(error_for_status(response).await);
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.try_next().await? {
            dst.write_all(&chunk).await?;
        }
        dst.flush().await?;

        Ok(())
    }

    /// Returns the number of compressions performed under this key.
    ///
    /// The service reports the counter on every response, so this sends
    /// the cheapest request that carries it: an empty-body POST to the
    /// shrink endpoint.
    pub async fn used_quota(&self) -> Result<u64, ClientError> {
        let response = self
            .http
            .post(self.shrink_url())
            .basic_auth(BASIC_AUTH_USER, Some(&self.api_key))
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }

        compression_count(&response).ok_or(ClientError::QuotaHeaderMissing)
    }

    fn shrink_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path("/shrink");
        url
    }
}

fn compression_count(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(COMPRESSION_COUNT)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Maps a non-success response onto the error taxonomy, consuming the
/// body for the `{error, message}` envelope where one is expected.
async fn error_for_status(response: Response) -> ClientError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ClientError::TooManyRequests,
        StatusCode::BAD_REQUEST => {
            tracing::debug!("request rejected: {}", remote_message(response).await);
            ClientError::BadRequest
        }
        status if status.is_client_error() || status.is_server_error() => {
            ClientError::Remote(remote_message(response).await)
        }
        status => ClientError::UnexpectedStatus(status),
    }
}

async fn remote_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorEnvelope>().await {
        Ok(envelope) => format!("{} ({})", envelope.message, envelope.error),
        Err(_) => status.to_string(),
    }
}
