//! OCR provider abstraction and the fallback chain.
//!
//! Providers are tried in order of output quality: the remote OCR API
//! (markdown-quality output), then a vision model transcribing rendered
//! pages, then the document's own text layer. A provider whose credential is
//! absent is skipped rather than failed. When every provider fails, the
//! chain reports the last transient error if there was one (so the retry
//! wrapper can re-run it) or a terminal error naming the remote providers.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::DynamicImage;
use pdfium_render::prelude::*;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::credentials::CredentialResolver;
use crate::error::ExtractionError;

/// A page with fewer words than this in its text layer is considered
/// scanned and re-extracted through local OCR.
const SPARSE_PAGE_WORD_THRESHOLD: usize = 50;

/// Extracted text plus which provider produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub text: String,
    pub provider: String,
}

/// One way of turning a PDF into text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Stable provider name recorded in journal entries.
    fn name(&self) -> &'static str;

    async fn extract(&self, pdf_path: &Path) -> Result<OcrOutcome, ExtractionError>;
}

/// Locate the PDFium library: current directory, vendor directory, then the
/// system paths.
fn create_pdfium() -> Result<Pdfium, ExtractionError> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "./vendor/pdfium/lib/",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| ExtractionError::Pdf {
            message: format!("Failed to load PDFium library: {e:?}"),
        })?;
    Ok(Pdfium::new(bindings))
}

/// Remote OCR API client: upload the document, request OCR on the uploaded
/// file, collect text fragments, best-effort delete the upload. Concurrency
/// is bounded by a shared semaphore independent of the item worker pool.
pub struct RemoteOcr {
    client: Client,
    config: ProviderConfig,
    credentials: Arc<dyn CredentialResolver>,
    limiter: Arc<Semaphore>,
}

impl RemoteOcr {
    pub fn new(
        config: ProviderConfig,
        credentials: Arc<dyn CredentialResolver>,
        limiter: Arc<Semaphore>,
    ) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(config.ocr_timeout())
            .build()
            .map_err(|source| ExtractionError::Network {
                provider: "remote_ocr",
                source,
            })?;
        Ok(Self {
            client,
            config,
            credentials,
            limiter,
        })
    }

    async fn upload(&self, api_key: &str, pdf_path: &Path) -> Result<String, ExtractionError> {
        let filename = pdf_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let bytes = tokio::fs::read(pdf_path).await?;

        let form = reqwest::multipart::Form::new()
            .text("purpose", "ocr")
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(filename)
                    .mime_str("application/pdf")
                    .map_err(|_| ExtractionError::MalformedResponse {
                        provider: "remote_ocr",
                        message: "invalid upload mime type".to_string(),
                    })?,
            );

        let base = self.config.ocr_base_url.trim_end_matches('/');
        let response = self
            .client
            .post(format!("{base}/v1/files"))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|source| ExtractionError::Network {
                provider: "remote_ocr",
                source,
            })?;
        let payload = check_status("remote_ocr", response).await?;

        payload["id"]
            .as_str()
            .or_else(|| payload["file_id"].as_str())
            .or_else(|| payload["data"]["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ExtractionError::MalformedResponse {
                provider: "remote_ocr",
                message: "upload response carries no file id".to_string(),
            })
    }

    async fn request_ocr(&self, api_key: &str, file_id: &str) -> Result<Value, ExtractionError> {
        let base = self.config.ocr_base_url.trim_end_matches('/');
        let body = json!({
            "model": self.config.ocr_model,
            "document": { "type": "file", "file_id": file_id },
            "include_image_base64": false,
        });

        let response = self
            .client
            .post(format!("{base}/v1/ocr"))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ExtractionError::Network {
                provider: "remote_ocr",
                source,
            })?;
        check_status("remote_ocr", response).await
    }

    async fn delete_upload(&self, api_key: &str, file_id: &str) {
        let base = self.config.ocr_base_url.trim_end_matches('/');
        if let Err(e) = self
            .client
            .delete(format!("{base}/v1/files/{file_id}"))
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(15))
            .send()
            .await
        {
            debug!(file_id, error = %e, "Failed to clean up OCR upload");
        }
    }
}

#[async_trait]
impl TextExtractor for RemoteOcr {
    fn name(&self) -> &'static str {
        "remote_ocr"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<OcrOutcome, ExtractionError> {
        let api_key = self.credentials.require(&self.config.ocr_api_key_env)?;

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ExtractionError::Cancelled)?;
        debug!(path = %pdf_path.display(), "Remote OCR slot acquired");

        let file_id = self.upload(&api_key, pdf_path).await?;
        let payload = self.request_ocr(&api_key, &file_id).await;
        self.delete_upload(&api_key, &file_id).await;
        let payload = payload?;

        let text = collect_ocr_fragments(&payload);
        if text.is_empty() {
            return Err(ExtractionError::MalformedResponse {
                provider: "remote_ocr",
                message: "response contains no text".to_string(),
            });
        }

        Ok(OcrOutcome {
            text,
            provider: self.name().to_string(),
        })
    }
}

/// Pull text out of an OCR response, wherever the API put it: top-level
/// `markdown`/`text`, per-page entries, or output blocks. Duplicate
/// fragments are collapsed, order preserved.
fn collect_ocr_fragments(payload: &Value) -> String {
    let mut fragments: Vec<String> = Vec::new();
    let mut push = |value: &Value| {
        if let Some(s) = value.as_str() {
            let s = s.trim();
            if !s.is_empty() && !fragments.iter().any(|f| f == s) {
                fragments.push(s.to_string());
            }
        }
    };

    push(&payload["markdown"]);
    push(&payload["text"]);
    if let Some(pages) = payload["pages"].as_array() {
        for page in pages {
            push(&page["markdown"]);
            push(&page["text"]);
        }
    }
    if let Some(blocks) = payload["output"].as_array() {
        for block in blocks {
            push(&block["markdown"]);
            push(&block["text"]);
            push(&block["content"]);
        }
    }

    fragments.join("\n\n")
}

async fn check_status(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<Value, ExtractionError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ExtractionError::ProviderStatus {
            provider,
            status: status.as_u16(),
            message: message.chars().take(500).collect(),
        });
    }
    response
        .json()
        .await
        .map_err(|source| ExtractionError::Network { provider, source })
}

/// Vision-model transcription: render each page through PDFium, send the PNG
/// to a chat-completions endpoint, stitch the per-page markdown together.
/// Page count is capped by configuration; rendering happens on a blocking
/// thread because PDFium is synchronous.
pub struct VisionOcr {
    client: Client,
    config: ProviderConfig,
    credentials: Arc<dyn CredentialResolver>,
}

impl VisionOcr {
    pub fn new(
        config: ProviderConfig,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(config.ocr_timeout())
            .build()
            .map_err(|source| ExtractionError::Network {
                provider: "vision",
                source,
            })?;
        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    async fn transcribe_page(
        &self,
        api_key: &str,
        page_number: usize,
        png_base64: &str,
    ) -> Result<String, ExtractionError> {
        let base = self.config.vision_base_url.trim_end_matches('/');
        let body = json!({
            "model": self.config.vision_model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a meticulous OCR engine that outputs Markdown without omitting any content.",
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": format!("Transcribe this page to Markdown.\nPage {page_number}."),
                        },
                        {
                            "type": "image_url",
                            "image_url": { "url": format!("data:image/png;base64,{png_base64}") },
                        }
                    ],
                }
            ],
        });

        let response = self
            .client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ExtractionError::Network {
                provider: "vision",
                source,
            })?;
        let payload = check_status("vision", response).await?;

        Ok(payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

/// Render the first `max_pages` pages of a PDF to base64-encoded PNGs.
fn render_pages_base64(
    pdf_path: &Path,
    max_pages: usize,
    scale: f32,
) -> Result<Vec<String>, ExtractionError> {
    let pdfium = create_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| ExtractionError::Pdf {
            message: format!("Failed to load PDF: {e:?}"),
        })?;

    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);
    let mut pages = Vec::new();
    for page in document.pages().iter().take(max_pages) {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ExtractionError::Pdf {
                message: format!("Failed to render page: {e:?}"),
            })?;
        let image: DynamicImage = bitmap.as_image();

        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| ExtractionError::Pdf {
                message: format!("Failed to encode page image: {e}"),
            })?;
        pages.push(BASE64.encode(&png));
    }
    Ok(pages)
}

#[async_trait]
impl TextExtractor for VisionOcr {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<OcrOutcome, ExtractionError> {
        let api_key = self.credentials.require(&self.config.vision_api_key_env)?;

        let path = pdf_path.to_path_buf();
        let max_pages = self.config.vision_max_pages;
        let scale = self.config.vision_render_scale;
        let pages = tokio::task::spawn_blocking(move || render_pages_base64(&path, max_pages, scale))
            .await
            .map_err(|_| ExtractionError::Cancelled)??;

        let mut outputs = Vec::new();
        for (index, png_base64) in pages.iter().enumerate() {
            let page_number = index + 1;
            let text = self
                .transcribe_page(&api_key, page_number, png_base64)
                .await?;
            if !text.is_empty() {
                outputs.push(format!("<!-- Page {page_number} -->\n{text}"));
            }
        }

        if outputs.is_empty() {
            return Err(ExtractionError::MalformedResponse {
                provider: "vision",
                message: "no page produced any text".to_string(),
            });
        }
        Ok(OcrOutcome {
            text: outputs.join("\n\n"),
            provider: self.name().to_string(),
        })
    }
}

/// Last-resort extractor: the PDF's own text layer, with sparse pages
/// (scanned pages with little or no embedded text) re-extracted through the
/// `tesseract` CLI when it is installed.
pub struct LocalTextExtractor {
    render_scale: f32,
}

impl LocalTextExtractor {
    pub fn new(render_scale: f32) -> Self {
        Self { render_scale }
    }

    fn extract_sync(pdf_path: &Path, render_scale: f32) -> Result<String, ExtractionError> {
        let pdfium = create_pdfium()?;
        let document =
            pdfium
                .load_pdf_from_file(pdf_path, None)
                .map_err(|e| ExtractionError::Pdf {
                    message: format!("Failed to load PDF: {e:?}"),
                })?;

        let render_config = PdfRenderConfig::new().scale_page_by_factor(render_scale);
        let mut page_texts: Vec<String> = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let text = match page.text() {
                Ok(text) => text.all().trim().to_string(),
                Err(e) => {
                    warn!(page = index + 1, error = ?e, "Failed to read page text layer");
                    String::new()
                }
            };

            let text = if text.split_whitespace().count() < SPARSE_PAGE_WORD_THRESHOLD {
                match ocr_page_with_tesseract(&page, &render_config) {
                    Ok(Some(ocr_text)) if !ocr_text.is_empty() => ocr_text,
                    _ => text,
                }
            } else {
                text
            };

            if !text.is_empty() {
                page_texts.push(text);
            }
        }
        Ok(page_texts.join("\n\n"))
    }
}

/// Render a page to a temporary PNG and run `tesseract` over it.
/// `Ok(None)` means the binary is not installed; the text layer stands.
fn ocr_page_with_tesseract(
    page: &PdfPage<'_>,
    render_config: &PdfRenderConfig,
) -> Result<Option<String>, ExtractionError> {
    let bitmap = page
        .render_with_config(render_config)
        .map_err(|e| ExtractionError::Pdf {
            message: format!("Failed to render page: {e:?}"),
        })?;
    let image: DynamicImage = bitmap.as_image();

    let dir = tempfile::tempdir()?;
    let png_path: PathBuf = dir.path().join("page.png");
    image
        .save(&png_path)
        .map_err(|e| ExtractionError::Pdf {
            message: format!("Failed to write page image: {e}"),
        })?;

    let output = match std::process::Command::new("tesseract")
        .arg(&png_path)
        .arg("stdout")
        .output()
    {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("tesseract not installed; keeping text layer output");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if !output.status.success() {
        warn!(status = ?output.status, "tesseract exited with an error");
        return Ok(None);
    }
    Ok(Some(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

#[async_trait]
impl TextExtractor for LocalTextExtractor {
    fn name(&self) -> &'static str {
        "local_text"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<OcrOutcome, ExtractionError> {
        let path = pdf_path.to_path_buf();
        let scale = self.render_scale;
        let text = tokio::task::spawn_blocking(move || Self::extract_sync(&path, scale))
            .await
            .map_err(|_| ExtractionError::Cancelled)??;

        if text.trim().is_empty() {
            return Err(ExtractionError::AllProvidersFailed);
        }
        Ok(OcrOutcome {
            text,
            provider: self.name().to_string(),
        })
    }
}

/// The ordered fallback chain.
pub struct OcrEngine {
    providers: Vec<Arc<dyn TextExtractor>>,
}

impl OcrEngine {
    pub fn new(providers: Vec<Arc<dyn TextExtractor>>) -> Self {
        Self { providers }
    }

    /// Full chain from configuration: remote OCR, vision, local text layer.
    pub fn from_config(
        providers: &ProviderConfig,
        credentials: Arc<dyn CredentialResolver>,
        ocr_limiter: Arc<Semaphore>,
    ) -> Result<Self, ExtractionError> {
        Ok(Self::new(vec![
            Arc::new(RemoteOcr::new(
                providers.clone(),
                credentials.clone(),
                ocr_limiter,
            )?),
            Arc::new(VisionOcr::new(providers.clone(), credentials)?),
            Arc::new(LocalTextExtractor::new(providers.vision_render_scale)),
        ]))
    }
}

#[async_trait]
impl TextExtractor for OcrEngine {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<OcrOutcome, ExtractionError> {
        let mut last_error: Option<ExtractionError> = None;

        for provider in &self.providers {
            match provider.extract(pdf_path).await {
                Ok(outcome) => {
                    info!(
                        provider = provider.name(),
                        path = %pdf_path.display(),
                        "Extraction succeeded"
                    );
                    return Ok(outcome);
                }
                Err(ExtractionError::MissingCredential { name }) => {
                    debug!(
                        provider = provider.name(),
                        credential = %name,
                        "Provider skipped: credential not configured"
                    );
                }
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        path = %pdf_path.display(),
                        error = %e,
                        "Provider failed; trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if e.is_transient() => Err(e),
            _ => Err(ExtractionError::AllProvidersFailed),
        }
    }
}
