// src/platform/http.rs

//! HTTP transport for the management server
//!
//! Desired-state responses are wrapped in an envelope:
//!
//! ```json
//! {"status": "OK", "message": null, "data": { ... }}
//! ```
//!
//! With response verification enabled the server signs the raw `data` text:
//! `X-Response-Signature` carries the SHA-1 of the shared secret followed by
//! the data with all whitespace removed. Downloads of server-hosted files
//! (`/files/` URLs) carry `X-Request-Signature` computed the same way over
//! the path after `/files/`.

use super::{ConfigServer, DeviceCreateOptions, Downloader, FetchRequest, ProgressFn};
use crate::error::{Error, Result};
use crate::hash::signature;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub const HEADER_REQUEST_SIGNATURE: &str = "X-Request-Signature";
pub const HEADER_RESPONSE_SIGNATURE: &str = "X-Response-Signature";

const STATUS_OK: &str = "OK";
const DATA_MARKER: &str = "\"data\":";
const FILES_MARKER: &str = "/files/";

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Unwrap an envelope, returning the `data` document as JSON text
pub fn parse_envelope(body: &str) -> Result<String> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| Error::Server(format!("Malformed response: {e}")))?;

    if envelope.status != STATUS_OK {
        return Err(Error::Server(
            envelope
                .message
                .unwrap_or_else(|| format!("status {}", envelope.status)),
        ));
    }

    match envelope.data {
        Some(Value::Null) | None => Err(Error::Server("Response carries no data".to_string())),
        Some(data) => Ok(data.to_string()),
    }
}

/// Check the response signature over the raw `data` text
pub fn verify_response(body: &str, server_signature: Option<&str>, secret: &str) -> Result<()> {
    let Some(server_signature) = server_signature else {
        return Err(Error::Verification(format!(
            "Missing {} header",
            HEADER_RESPONSE_SIGNATURE
        )));
    };

    let body = body.trim_end();
    let Some(pos) = body.find(DATA_MARKER) else {
        return Err(Error::Verification("Response has no data field".to_string()));
    };

    // Data runs to the envelope's closing brace
    let start = pos + DATA_MARKER.len();
    let data = body.get(start..body.len().saturating_sub(1)).unwrap_or("");
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();

    let calculated = signature(secret, &compact);
    if !calculated.eq_ignore_ascii_case(server_signature.trim()) {
        return Err(Error::Verification(format!(
            "Server signature {} doesn't match calculated {}",
            server_signature, calculated
        )));
    }
    Ok(())
}

/// Signature header value for server-hosted file URLs
pub fn request_signature(secret: &str, url: &str) -> Option<String> {
    url.find(FILES_MARKER)
        .map(|pos| signature(secret, &url[pos + FILES_MARKER.len()..]))
}

/// Connection settings for [`HttpConfigServer`]
#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    pub base_url: String,
    pub secondary_url: Option<String>,
    pub project: String,
    pub secret: String,
    pub verify_response: bool,
    pub timeout: Duration,
}

/// Management server client with primary/secondary failover
pub struct HttpConfigServer {
    client: Client,
    base_url: RwLock<String>,
    options: HttpServerOptions,
}

impl HttpConfigServer {
    pub fn new(options: HttpServerOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: RwLock::new(trim_base(&options.base_url)),
            options,
        })
    }

    /// Base URL plus the project prefix, if any
    fn api_root(&self, base: &str) -> String {
        let project = self.options.project.trim_matches('/');
        if project.is_empty() {
            format!("{}/rest", base)
        } else {
            format!("{}/{}/rest", base, project)
        }
    }

    fn configuration_url(&self, base: &str, device_id: &str) -> String {
        format!("{}/public/sync/configuration/{}", self.api_root(base), device_id)
    }

    fn confirmation_url(&self, base: &str, kind: &str, device_id: &str) -> String {
        let kind = if kind.is_empty() {
            String::new()
        } else {
            format!("{}/", kind)
        };
        format!(
            "{}/plugins/devicereset/public/{}{}",
            self.api_root(base),
            kind,
            device_id
        )
    }

    async fn send_fetch(
        &self,
        base: &str,
        request: &FetchRequest,
    ) -> std::result::Result<Response, reqwest::Error> {
        let url = self.configuration_url(base, &request.device_id);
        debug!("Requesting desired state from {}", url);

        let builder = match &request.create_options {
            Some(options) => self.client.post(&url).json::<DeviceCreateOptions>(options),
            None => self.client.get(&url),
        };

        builder
            .header(HEADER_REQUEST_SIGNATURE, &request.signature)
            .send()
            .await
    }

    /// Fetch from one base URL, no failover
    async fn fetch_from(&self, base: &str, request: &FetchRequest) -> Result<String> {
        let response = self
            .send_fetch(base, request)
            .await
            .map_err(|e| Error::Network(format!("{}: {e}", base)))?;
        self.read_document(response).await
    }

    async fn read_document(&self, response: Response) -> Result<String> {
        if !response.status().is_success() {
            return Err(Error::Server(format!("HTTP {}", response.status())));
        }

        let server_signature = response
            .headers()
            .get(HEADER_RESPONSE_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response: {e}")))?;

        if self.options.verify_response {
            verify_response(&body, server_signature.as_deref(), &self.options.secret)?;
        }

        parse_envelope(&body)
    }

    async fn confirm(&self, kind: &str, device_id: &str) -> Result<bool> {
        let url = self.confirmation_url(&self.current_url(), kind, device_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{}: {e}", url)))?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| Error::Server(format!("Malformed confirmation: {e}")))?;
        Ok(envelope.status == STATUS_OK)
    }
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[async_trait]
impl ConfigServer for HttpConfigServer {
    async fn fetch_desired_state(&self, request: &FetchRequest) -> Result<String> {
        let primary = self.current_url();

        let response = match self.send_fetch(&primary, request).await {
            Ok(response) => response,
            Err(e) => {
                let Some(secondary) = self.options.secondary_url.as_deref().map(trim_base) else {
                    return Err(Error::Network(format!("{}: {e}", primary)));
                };
                warn!("Primary server {} unreachable: {}, trying {}", primary, e, secondary);
                self.send_fetch(&secondary, request)
                    .await
                    .map_err(|e| Error::Network(format!("{}: {e}", secondary)))?
            }
        };

        self.read_document(response).await
    }

    async fn confirm_device_reset(&self, device_id: &str) -> Result<bool> {
        self.confirm("", device_id).await
    }

    async fn confirm_reboot(&self, device_id: &str) -> Result<bool> {
        self.confirm("reboot", device_id).await
    }

    async fn confirm_password_reset(&self, device_id: &str) -> Result<bool> {
        self.confirm("pwreset", device_id).await
    }

    fn current_url(&self) -> String {
        match self.base_url.read() {
            Ok(base) => base.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn migrate(&self, new_url: &str, request: &FetchRequest) -> Result<()> {
        let new_base = trim_base(new_url);
        self.fetch_from(&new_base, request).await?;

        let mut base = self
            .base_url
            .write()
            .map_err(|_| Error::IoError("server URL lock poisoned".to_string()))?;
        info!("Switching management server from {} to {}", *base, new_base);
        *base = new_base;
        Ok(())
    }
}

/// Streams artifacts into a temp directory
pub struct HttpDownloader {
    client: Client,
    temp_dir: PathBuf,
    secret: String,
}

impl HttpDownloader {
    pub fn new(temp_dir: impl Into<PathBuf>, secret: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            temp_dir: temp_dir.into(),
            secret: secret.into(),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    async fn stream_to(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<u64> {
        let mut request = self.client.get(url);
        if let Some(sig) = request_signature(&self.secret, url) {
            request = request.header(HEADER_REQUEST_SIGNATURE, sig);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| Error::Download(format!("Failed to fetch {}: {e}", url)))?;

        if !response.status().is_success() {
            return Err(Error::Download(format!("HTTP {} from {}", response.status(), url)));
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", dest.display())))?;

        let mut downloaded: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Download(format!("Failed to read {}: {e}", url)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
            downloaded += chunk.len() as u64;
            progress(percent(downloaded, total), total, downloaded);
        }

        file.flush()
            .await
            .map_err(|e| Error::IoError(format!("Failed to flush {}: {e}", dest.display())))?;
        Ok(downloaded)
    }
}

fn percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (current.saturating_mul(100) / total).min(100) as u8
}

/// Last segment of the URL path, used as the temp file suffix
pub fn artifact_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| "download".to_string())
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download_to_temp(&self, url: &str, progress: ProgressFn<'_>) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", self.temp_dir.display())))?;

        // Unique name per download; the artifact name stays last so the
        // extension survives. Dropped (and deleted) unless kept below.
        let partial = tempfile::Builder::new()
            .prefix("dl-")
            .suffix(&format!("-{}", artifact_name(url)))
            .tempfile_in(&self.temp_dir)
            .map_err(|e| Error::IoError(format!("Failed to create temp file: {e}")))?;
        info!("Downloading {} to {}", url, partial.path().display());

        let bytes = self.stream_to(url, partial.path(), progress).await?;
        let (_, dest) = partial
            .keep()
            .map_err(|e| Error::IoError(format!("Failed to keep download: {e}")))?;
        debug!("Downloaded {} bytes from {}", bytes, url);
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "changeme";

    fn signed(body: &str, data: &str) -> (String, String) {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        (body.to_string(), signature(SECRET, &compact))
    }

    #[test]
    fn test_parse_envelope_ok() {
        let doc = parse_envelope(r#"{"status":"OK","message":null,"data":{"files":[]}}"#).unwrap();
        assert_eq!(doc, r#"{"files":[]}"#);
    }

    #[test]
    fn test_parse_envelope_rejections() {
        let err = parse_envelope(r#"{"status":"ERROR","message":"error.notfound.device"}"#).unwrap_err();
        assert!(matches!(err, Error::Server(ref m) if m == "error.notfound.device"));

        assert!(matches!(
            parse_envelope(r#"{"status":"OK","data":null}"#),
            Err(Error::Server(_))
        ));
        assert!(matches!(parse_envelope("<html>"), Err(Error::Server(_))));
    }

    #[test]
    fn test_verify_response() {
        let data = r#"{"files": [], "reboot": true}"#;
        let (body, sig) = signed(&format!(r#"{{"status":"OK","message":null,"data":{}}}"#, data), data);

        verify_response(&body, Some(&sig), SECRET).unwrap();
        verify_response(&body, Some(&sig.to_uppercase()), SECRET).unwrap();
        verify_response(&format!("{}\n", body), Some(&sig), SECRET).unwrap();

        assert!(matches!(
            verify_response(&body, None, SECRET),
            Err(Error::Verification(_))
        ));
        assert!(matches!(
            verify_response(&body, Some("deadbeef"), SECRET),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn test_request_signature_only_for_server_files() {
        assert_eq!(
            request_signature(SECRET, "https://mdm.example.com/files/app.apk"),
            Some(signature(SECRET, "app.apk"))
        );
        assert_eq!(request_signature(SECRET, "https://cdn.example.com/app.apk"), None);
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("https://x.example.com/files/mail-2.1.apk"), "mail-2.1.apk");
        assert_eq!(artifact_name("https://x.example.com/"), "download");
        assert_eq!(artifact_name("not a url"), "download");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(10, 0), 0);
        assert_eq!(percent(300, 200), 100);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let server = HttpConfigServer::new(HttpServerOptions {
            base_url: "http://127.0.0.1:9/".to_string(),
            secondary_url: None,
            project: "mdm".to_string(),
            secret: SECRET.to_string(),
            verify_response: false,
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        assert_eq!(server.current_url(), "http://127.0.0.1:9");
        assert_eq!(
            server.configuration_url("http://127.0.0.1:9", "dev1"),
            "http://127.0.0.1:9/mdm/rest/public/sync/configuration/dev1"
        );
        assert_eq!(
            server.confirmation_url("http://127.0.0.1:9", "reboot", "dev1"),
            "http://127.0.0.1:9/mdm/rest/plugins/devicereset/public/reboot/dev1"
        );
        let request = FetchRequest {
            device_id: "dev1".to_string(),
            signature: signature(SECRET, "dev1"),
            create_options: None,
        };
        let err = server.fetch_desired_state(&request).await.unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let downloader =
            HttpDownloader::new(dir.path().join("tmp"), SECRET, Duration::from_secs(2)).unwrap();
        let progress = |_: u8, _: u64, _: u64| {};

        let result = downloader
            .download_to_temp("http://127.0.0.1:9/files/mail.apk", &progress)
            .await;

        assert!(matches!(result, Err(Error::Download(_))));
        assert_eq!(std::fs::read_dir(downloader.temp_dir()).unwrap().count(), 0);
    }
}
