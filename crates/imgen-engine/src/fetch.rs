use std::ffi::OsString;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, ImageReader};
use imgen_contracts::ImageArtifact;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::truncate_text;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

// Midjourney CDN images and streamed previews are 1024x1024 WebP variants the
// decoder cannot always read. Undecodable payloads are persisted under this
// metadata rather than rejected.
pub const FALLBACK_MIME_TYPE: &str = "image/webp";
pub const FALLBACK_EXTENSION: &str = "webp";
pub const FALLBACK_WIDTH: u32 = 1024;
pub const FALLBACK_HEIGHT: u32 = 1024;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub trait ImageTransport: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self, url: &str) -> Result<FetchResponse>;
}

pub struct HttpImageTransport {
    name: &'static str,
    http: HttpClient,
}

impl HttpImageTransport {
    /// Default client presenting a desktop browser User-Agent.
    pub fn primary() -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build primary image client")?;
        Ok(Self {
            name: "primary",
            http,
        })
    }

    /// Separate HTTP/1.1 client sending the full header set of a Chrome
    /// navigation request, for CDNs that reject the primary signature.
    pub fn browser_emulation() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(
            "sec-ch-ua",
            HeaderValue::from_static(
                "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
            ),
        );
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"macOS\""));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("image"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("no-cors"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));
        let http = HttpClient::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .http1_only()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build browser-emulating image client")?;
        Ok(Self {
            name: "browser-emulation",
            http,
        })
    }
}

impl ImageTransport for HttpImageTransport {
    fn name(&self) -> &str {
        self.name
    }

    fn get(&self, url: &str) -> Result<FetchResponse> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("image request failed ({url})"))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .with_context(|| format!("failed reading image bytes ({url})"))?
            .to_vec();
        Ok(FetchResponse {
            status,
            content_type,
            bytes,
        })
    }
}

pub struct ImageFetcher {
    primary: Box<dyn ImageTransport>,
    alternate: Box<dyn ImageTransport>,
}

impl ImageFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self::with_transports(
            Box::new(HttpImageTransport::primary()?),
            Box::new(HttpImageTransport::browser_emulation()?),
        ))
    }

    pub fn with_transports(
        primary: Box<dyn ImageTransport>,
        alternate: Box<dyn ImageTransport>,
    ) -> Self {
        Self { primary, alternate }
    }

    /// Retrieves `source` (a URL, or base64 when `inline`), then writes it to
    /// `<destination_stem>.<extension>` and reports its metadata.
    pub fn fetch_and_save(
        &self,
        source: &str,
        destination_stem: &Path,
        inline: bool,
    ) -> Result<ImageArtifact> {
        let bytes = if inline {
            decode_inline_image(source)?
        } else {
            self.download(source)?
        };
        if bytes.is_empty() {
            let origin = if inline { "inline payload" } else { source };
            return Err(FetchError::EmptyPayload {
                origin: origin.to_string(),
            }
            .into());
        }
        save_image_bytes(&bytes, destination_stem)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.primary.get(url)?;
        debug!(
            url,
            status = response.status,
            content_type = response.content_type.as_deref().unwrap_or(""),
            transport = self.primary.name(),
            "image download"
        );
        if response.status == 200 {
            return Ok(response.bytes);
        }

        warn!(
            url,
            status = response.status,
            transport = self.alternate.name(),
            "primary image download failed, retrying with alternate transport"
        );
        let retry = self.alternate.get(url).inspect_err(|err| {
            error!(url, transport = self.alternate.name(), "alternate image download failed: {err:#}");
        })?;
        debug!(url, status = retry.status, transport = self.alternate.name(), "image download");
        if retry.status != 200 {
            let body = String::from_utf8_lossy(&retry.bytes);
            let err = FetchError::Transport {
                url: url.to_string(),
                message: format!(
                    "primary returned {}, alternate returned {}: {}",
                    response.status,
                    retry.status,
                    truncate_text(&body, 512)
                ),
            };
            error!(url, "{err}");
            return Err(err.into());
        }
        Ok(retry.bytes)
    }
}

/// Accepts bare base64 or a `data:<mime>;base64,<payload>` URL.
pub fn decode_inline_image(source: &str) -> Result<Vec<u8>, FetchError> {
    let trimmed = source.trim();
    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => trimmed,
    };
    Ok(BASE64.decode(payload.trim())?)
}

/// Persists already-retrieved bytes under `destination_stem`.
///
/// Decodable images are written as `<stem>.<format>`. Anything else is kept
/// twice: verbatim as `<stem>_raw.bin`, and as `<stem>.webp` reported with the
/// fixed fallback metadata.
pub fn save_image_bytes(bytes: &[u8], destination_stem: &Path) -> Result<ImageArtifact> {
    match probe_image(bytes) {
        Ok((format, width, height)) => {
            let (mime_type, extension) = format_mime_and_extension(format);
            let path = with_suffix(destination_stem, &format!(".{extension}"));
            write_atomically(&path, bytes)?;
            info!(path = %path.display(), width, height, mime_type, "image saved");
            Ok(ImageArtifact {
                mime_type: mime_type.to_string(),
                width,
                height,
                extension: extension.to_string(),
                local_filename: file_name(&path),
            })
        }
        Err(err) => {
            warn!(stem = %destination_stem.display(), "image decode failed, keeping raw bytes: {err:#}");
            let debug_path = with_suffix(destination_stem, "_raw.bin");
            let path = with_suffix(destination_stem, &format!(".{FALLBACK_EXTENSION}"));
            let staged_image = stage_write(&path, bytes)?;
            let staged_debug = stage_write(&debug_path, bytes)?;
            persist_staged(staged_image, &path)?;
            if let Err(err) = persist_staged(staged_debug, &debug_path) {
                let _ = fs::remove_file(&path);
                return Err(err);
            }
            info!(path = %path.display(), "saved undecodable image bytes with fallback metadata");
            Ok(ImageArtifact {
                mime_type: FALLBACK_MIME_TYPE.to_string(),
                width: FALLBACK_WIDTH,
                height: FALLBACK_HEIGHT,
                extension: FALLBACK_EXTENSION.to_string(),
                local_filename: file_name(&path),
            })
        }
    }
}

fn probe_image(bytes: &[u8]) -> Result<(ImageFormat, u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff image format")?;
    let format = reader
        .format()
        .ok_or_else(|| anyhow::anyhow!("unrecognized image container"))?;
    let (width, height) = reader
        .into_dimensions()
        .context("failed to read image dimensions")?;
    Ok((format, width, height))
}

fn format_mime_and_extension(format: ImageFormat) -> (&'static str, &'static str) {
    match format {
        ImageFormat::Png => ("image/png", "png"),
        ImageFormat::Jpeg => ("image/jpeg", "jpeg"),
        ImageFormat::WebP => ("image/webp", "webp"),
        ImageFormat::Gif => ("image/gif", "gif"),
        ImageFormat::Bmp => ("image/bmp", "bmp"),
        ImageFormat::Tiff => ("image/tiff", "tiff"),
        ImageFormat::Ico => ("image/x-icon", "ico"),
        ImageFormat::Avif => ("image/avif", "avif"),
        ImageFormat::Tga => ("image/x-tga", "tga"),
        _ => ("image/png", "png"),
    }
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(stem.as_os_str());
    raw.push(suffix);
    PathBuf::from(raw)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let staged = stage_write(path, bytes)?;
    persist_staged(staged, path)
}

/// Writes `bytes` to a temporary file beside `path` without touching `path`.
fn stage_write(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage write in {}", dir.display()))?;
    staged
        .write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(staged)
}

fn persist_staged(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use base64::Engine as _;
    use image::{Rgb, RgbImage};

    use super::*;

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 40, 10]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    /// Serves scripted responses in order and records every requested URL.
    #[derive(Clone)]
    pub(crate) struct ScriptedTransport {
        name: &'static str,
        responses: Arc<Mutex<Vec<Result<FetchResponse, String>>>>,
        pub(crate) requested: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(name: &'static str, responses: Vec<Result<FetchResponse, String>>) -> Self {
            Self {
                name,
                responses: Arc::new(Mutex::new(responses)),
                requested: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn ok(name: &'static str, status: u16, bytes: Vec<u8>) -> Self {
            Self::new(
                name,
                vec![Ok(FetchResponse {
                    status,
                    content_type: None,
                    bytes,
                })],
            )
        }

        pub(crate) fn requests(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl ImageTransport for ScriptedTransport {
        fn name(&self) -> &str {
            self.name
        }

        fn get(&self, url: &str) -> Result<FetchResponse> {
            self.requested.lock().unwrap().push(url.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("{} has no scripted response for {url}", self.name);
            }
            responses.remove(0).map_err(|message| anyhow::anyhow!(message))
        }
    }

    fn fetcher(primary: &ScriptedTransport, alternate: &ScriptedTransport) -> ImageFetcher {
        ImageFetcher::with_transports(Box::new(primary.clone()), Box::new(alternate.clone()))
    }

    #[test]
    fn decoded_png_is_saved_with_detected_format() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stem = temp.path().join("im_abc");
        let bytes = png_bytes(32, 16);

        let artifact = save_image_bytes(&bytes, &stem)?;

        assert_eq!(artifact.mime_type, "image/png");
        assert_eq!((artifact.width, artifact.height), (32, 16));
        assert_eq!(artifact.extension, "png");
        assert_eq!(artifact.local_filename, "im_abc.png");
        assert_eq!(fs::read(temp.path().join("im_abc.png"))?, bytes);
        assert_eq!(fs::read_dir(temp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn undecodable_bytes_use_webp_fallback_and_keep_raw_copy() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stem = temp.path().join("im_raw");
        let bytes = b"RIFF\x10\x00\x00\x00WEBPVP8X-not-really".to_vec();

        let artifact = save_image_bytes(&bytes, &stem)?;

        assert_eq!(
            artifact.clone().into_tuple(),
            ("image/webp".to_string(), 1024, 1024, "im_raw.webp".to_string())
        );
        assert_eq!(artifact.extension, "webp");
        assert_eq!(fs::read(temp.path().join("im_raw_raw.bin"))?, bytes);
        assert_eq!(fs::read(temp.path().join("im_raw.webp"))?, bytes);
        Ok(())
    }

    #[test]
    fn blocked_fallback_target_leaves_no_raw_copy() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("im_p.webp").join("child"))?;

        let result = save_image_bytes(b"not an image", &temp.path().join("im_p"));

        assert!(result.is_err());
        let mut names: Vec<String> = fs::read_dir(temp.path())?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        assert_eq!(names, vec!["im_p.webp"]);
        assert!(temp.path().join("im_p.webp").is_dir());
        Ok(())
    }

    #[test]
    fn missing_destination_directory_is_created() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stem = temp.path().join("nested").join("files").join("im_dir");
        let artifact = save_image_bytes(&png_bytes(4, 4), &stem)?;
        assert!(temp.path().join("nested/files").join(artifact.local_filename).exists());
        Ok(())
    }

    #[test]
    fn inline_payload_accepts_bare_and_data_url_base64() -> anyhow::Result<()> {
        let bytes = png_bytes(2, 3);
        let encoded = BASE64.encode(&bytes);
        assert_eq!(decode_inline_image(&encoded)?, bytes);
        assert_eq!(
            decode_inline_image(&format!("data:image/webp;base64,{encoded}"))?,
            bytes
        );
        assert!(matches!(
            decode_inline_image("%%%"),
            Err(FetchError::InvalidInline(_))
        ));
        Ok(())
    }

    #[test]
    fn inline_fetch_does_not_touch_transports() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let primary = ScriptedTransport::new("primary", Vec::new());
        let alternate = ScriptedTransport::new("alternate", Vec::new());
        let encoded = format!("data:image/png;base64,{}", BASE64.encode(png_bytes(8, 8)));

        let artifact =
            fetcher(&primary, &alternate).fetch_and_save(&encoded, &temp.path().join("im_inl"), true)?;

        assert_eq!(artifact.local_filename, "im_inl.png");
        assert!(primary.requests().is_empty());
        assert!(alternate.requests().is_empty());
        Ok(())
    }

    #[test]
    fn primary_success_skips_alternate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let primary = ScriptedTransport::ok("primary", 200, png_bytes(10, 20));
        let alternate = ScriptedTransport::new("alternate", Vec::new());

        let artifact = fetcher(&primary, &alternate).fetch_and_save(
            "https://cdn.example.test/a.png",
            &temp.path().join("im_one"),
            false,
        )?;

        assert_eq!((artifact.width, artifact.height), (10, 20));
        assert_eq!(primary.requests(), vec!["https://cdn.example.test/a.png"]);
        assert!(alternate.requests().is_empty());
        Ok(())
    }

    #[test]
    fn primary_404_retries_once_on_alternate_transport() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let primary = ScriptedTransport::ok("primary", 404, b"not found".to_vec());
        let alternate = ScriptedTransport::ok("alternate", 200, png_bytes(64, 48));

        let artifact = fetcher(&primary, &alternate).fetch_and_save(
            "https://cdn.example.test/b.png",
            &temp.path().join("im_two"),
            false,
        )?;

        assert_eq!(
            artifact.into_tuple(),
            ("image/png".to_string(), 64, 48, "im_two.png".to_string())
        );
        assert_eq!(alternate.requests(), vec!["https://cdn.example.test/b.png"]);
        Ok(())
    }

    #[test]
    fn alternate_failure_propagates_without_writing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let primary = ScriptedTransport::ok("primary", 403, Vec::new());
        let alternate = ScriptedTransport::ok("alternate", 503, b"busy".to_vec());

        let err = fetcher(&primary, &alternate)
            .fetch_and_save("https://cdn.example.test/c.png", &temp.path().join("im_three"), false)
            .unwrap_err();

        let typed = err.downcast_ref::<FetchError>();
        assert!(matches!(typed, Some(FetchError::Transport { .. })));
        assert!(err.to_string().contains("503"));
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);

        let primary = ScriptedTransport::ok("primary", 500, Vec::new());
        let alternate = ScriptedTransport::new("alternate", vec![Err("tls handshake failed".to_string())]);
        let err = fetcher(&primary, &alternate)
            .fetch_and_save("https://cdn.example.test/d.png", &temp.path().join("im_four"), false)
            .unwrap_err();
        assert!(format!("{err:#}").contains("tls handshake failed"));
        Ok(())
    }

    #[test]
    fn empty_payload_is_rejected_before_any_write() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let primary = ScriptedTransport::ok("primary", 200, Vec::new());
        let alternate = ScriptedTransport::new("alternate", Vec::new());

        let err = fetcher(&primary, &alternate)
            .fetch_and_save("https://cdn.example.test/e.webp", &temp.path().join("im_five"), false)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FetchError>(),
            Some(FetchError::EmptyPayload { .. })
        ));
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }
}
