//! Media hosting API client.
//!
//! Uploads go out as unsigned multipart requests against an upload preset.
//! Thumbnails and optimized variants are derived by rewriting the delivery URL;
//! the media host renders the transformation on first request.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::StoreError;

/// Default media API endpoint.
pub const DEFAULT_MEDIA_API_URL: &str = "https://api.cloudinary.com";

/// Size of each chunk fed to the request body, and the progress granularity.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Path segment after which transformations are inserted.
const UPLOAD_SEGMENT: &str = "/upload/";

/// Progress callback, called with a percentage in `0..=100`.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Options for a single upload.
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Folder to file the asset under.
    pub folder: Option<String>,
    pub on_progress: Option<ProgressCallback>,
}

/// A successfully uploaded asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedMedia {
    #[serde(rename = "secure_url")]
    pub url: String,
    pub public_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub bytes: u64,
}

/// Options for [`derive_optimized_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizeOptions {
    pub width: Option<u32>,
    /// Quality setting, `auto` by default.
    pub quality: String,
    /// Delivery format, `auto` by default.
    pub format: String,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            width: None,
            quality: "auto".to_string(),
            format: "auto".to_string(),
        }
    }
}

/// Client for the media upload API.
#[derive(Clone)]
pub struct MediaClient {
    http: Client,
    api_url: String,
    cloud_name: String,
    upload_preset: String,
}

impl MediaClient {
    pub fn new(cloud_name: impl Into<String>, upload_preset: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // Large uploads on slow links.
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build tuned HTTP client, using defaults");
                Client::new()
            });

        Self {
            http,
            api_url: DEFAULT_MEDIA_API_URL.to_string(),
            cloud_name: cloud_name.into(),
            upload_preset: upload_preset.into(),
        }
    }

    /// Point the client at a different API host.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Upload a file's bytes.
    pub async fn upload(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        options: UploadOptions,
    ) -> Result<UploadedMedia, StoreError> {
        if contents.is_empty() {
            return Err(StoreError::InvalidRequest("refusing to upload an empty file".into()));
        }

        let total = contents.len() as u64;
        let part = Part::stream_with_length(progress_body(contents, options.on_progress.clone()), total)
            .file_name(file_name.to_string());

        let mut form = Form::new()
            .text("upload_preset", self.upload_preset.clone())
            .part("file", part);
        if let Some(folder) = &options.folder {
            form = form.text("folder", folder.clone());
        }

        let url = format!("{}/v1_1/{}/auto/upload", self.api_url, self.cloud_name);
        debug!(file = %file_name, bytes = total, "uploading media");

        let response = self.http.post(&url).multipart(form).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<UploadErrorBody>(&text)
                .map(|b| b.error.message)
                .unwrap_or(text);
            return Err(StoreError::Upload(format!("{} ({})", message, status)));
        }

        let uploaded: UploadedMedia = serde_json::from_str(&text)?;
        if let Some(on_progress) = &options.on_progress {
            on_progress(100);
        }
        debug!(public_id = %uploaded.public_id, "media uploaded");
        Ok(uploaded)
    }
}

/// Body that reports how much of `contents` has been handed to the transport.
fn progress_body(contents: Vec<u8>, on_progress: Option<ProgressCallback>) -> reqwest::Body {
    let total = contents.len().max(1);
    let chunks: Vec<Vec<u8>> = contents
        .chunks(UPLOAD_CHUNK_SIZE)
        .map(<[u8]>::to_vec)
        .collect();

    let mut sent = 0usize;
    let stream = stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len();
        if let Some(on_progress) = &on_progress {
            // Hold back 100 until the host has accepted the file.
            on_progress(((sent * 100 / total) as u8).min(99));
        }
        Ok::<_, std::io::Error>(chunk)
    }));

    reqwest::Body::wrap_stream(stream)
}

#[derive(Debug, Deserialize)]
struct UploadErrorBody {
    error: UploadErrorMessage,
}

#[derive(Debug, Deserialize)]
struct UploadErrorMessage {
    message: String,
}

/// Insert a transformation segment after `/upload/`. URLs from other hosts are
/// returned unchanged.
fn with_transformation(url: &str, transformation: &str) -> String {
    match url.find(UPLOAD_SEGMENT) {
        Some(idx) => {
            let split = idx + UPLOAD_SEGMENT.len();
            format!("{}{}/{}", &url[..split], transformation, &url[split..])
        }
        None => url.to_string(),
    }
}

/// Square, center-cropped thumbnail of an uploaded image.
pub fn derive_thumbnail_url(url: &str, size: u32) -> String {
    with_transformation(url, &format!("c_fill,w_{},h_{}", size, size))
}

/// Variant with automatic quality and format, optionally scaled to a width.
pub fn derive_optimized_url(url: &str, options: &OptimizeOptions) -> String {
    let mut transformation = format!("q_{},f_{}", options.quality, options.format);
    if let Some(width) = options.width {
        transformation.push_str(&format!(",w_{}", width));
    }
    with_transformation(url, &transformation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const IMAGE: &str = "https://res.cloudinary.com/studio/image/upload/v1712/thumbs/abc.jpg";

    #[test]
    fn thumbnail_inserts_crop_transformation() {
        assert_eq!(
            derive_thumbnail_url(IMAGE, 200),
            "https://res.cloudinary.com/studio/image/upload/c_fill,w_200,h_200/v1712/thumbs/abc.jpg"
        );
    }

    #[test]
    fn optimized_url_includes_width_when_given() {
        let options = OptimizeOptions {
            width: Some(800),
            ..Default::default()
        };
        assert_eq!(
            derive_optimized_url(IMAGE, &options),
            "https://res.cloudinary.com/studio/image/upload/q_auto,f_auto,w_800/v1712/thumbs/abc.jpg"
        );
    }

    #[test]
    fn foreign_urls_are_left_alone() {
        let url = "https://example.com/poster.png";
        assert_eq!(derive_thumbnail_url(url, 64), url);
    }

    #[tokio::test]
    async fn upload_reports_progress_and_parses_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1_1/studio/auto/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "secure_url": IMAGE,
                "public_id": "thumbs/abc",
                "width": 1920,
                "height": 1080,
                "format": "jpg",
                "bytes": 150000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let options = UploadOptions {
            folder: Some("thumbs".into()),
            on_progress: Some(Arc::new(move |pct| seen_cb.lock().push(pct))),
        };

        let client = MediaClient::new("studio", "unsigned").with_api_url(server.uri());
        let uploaded = client
            .upload("abc.jpg", vec![7u8; 150_000], options)
            .await
            .unwrap();

        assert_eq!(uploaded.public_id, "thumbs/abc");
        assert_eq!(uploaded.width, 1920);

        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn upload_error_message_is_surfaced() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1_1/studio/auto/upload"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "Upload preset not found" }
            })))
            .mount(&server)
            .await;

        let client = MediaClient::new("studio", "missing").with_api_url(server.uri());
        let err = client
            .upload("a.png", vec![1, 2, 3], UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Upload(msg) if msg.contains("Upload preset not found")));
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_locally() {
        let client = MediaClient::new("studio", "unsigned").with_api_url("http://127.0.0.1:9");
        let err = client
            .upload("empty.png", Vec::new(), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }
}
