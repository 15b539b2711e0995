//! Figure cropping via a remote PDF-to-PNG service.
//!
//! The service renders one page of the document at `document_url`, clipped
//! to a rectangle in PDF points, and returns a link to the PNG, which is
//! then downloaded. Page indices are 0-based on this API.

use super::send;
use crate::config::ServiceSettings;
use crate::error::{IngestError, UpstreamError};
use crate::figure::Rect;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "cropper";

/// One crop: a page of a remote document and a rectangle in points.
#[derive(Debug, Clone, PartialEq)]
pub struct CropRequest {
    pub document_url: String,
    /// 0-based page index.
    pub page_index: usize,
    pub rect: Rect,
}

#[async_trait]
pub trait FigureCropper: Send + Sync {
    /// PNG bytes of the cropped region.
    async fn crop(&self, request: &CropRequest) -> Result<Vec<u8>, UpstreamError>;
}

/// pdf.co-style `convert/to/png` client.
pub struct PdfCoCropper {
    client: reqwest::Client,
    endpoint: String,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct ConvertRequest<'a> {
    url: &'a str,
    pages: String,
    rect: String,
    #[serde(rename = "async")]
    is_async: bool,
}

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
}

impl ConvertResponse {
    fn image_url(self) -> Result<String, UpstreamError> {
        if self.error {
            return Err(UpstreamError::InvalidResponse {
                service: SERVICE.to_string(),
                detail: self.message.unwrap_or_else(|| "crop failed".into()),
            });
        }
        self.urls
            .into_iter()
            .next()
            .or(self.url)
            .ok_or_else(|| UpstreamError::InvalidResponse {
                service: SERVICE.to_string(),
                detail: "no image url in reply".into(),
            })
    }
}

impl PdfCoCropper {
    pub fn new(settings: &ServiceSettings) -> Result<Self, IngestError> {
        let key = settings.require_crop_api_key()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(key).map_err(|_| {
                IngestError::InvalidConfig("cropping API key contains invalid characters".into())
            })?,
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: settings.crop_endpoint.clone(),
            timeout_secs: settings.http_timeout_secs,
        })
    }
}

/// `x,y,width,height` in points, as the API expects.
pub fn rect_param(rect: &Rect) -> String {
    format!(
        "{:.2},{:.2},{:.2},{:.2}",
        rect.x, rect.y, rect.width, rect.height
    )
}

#[async_trait]
impl FigureCropper for PdfCoCropper {
    async fn crop(&self, request: &CropRequest) -> Result<Vec<u8>, UpstreamError> {
        let body = ConvertRequest {
            url: &request.document_url,
            pages: request.page_index.to_string(),
            rect: rect_param(&request.rect),
            is_async: false,
        };
        debug!(
            "Cropping page index {} rect {}",
            request.page_index, body.rect
        );
        let reply: ConvertResponse = send(
            SERVICE,
            self.client.post(&self.endpoint).json(&body),
            self.timeout_secs,
        )
        .await?
        .json()
        .await
        .map_err(|e| UpstreamError::InvalidResponse {
            service: SERVICE.to_string(),
            detail: e.to_string(),
        })?;

        let image_url = reply.image_url()?;
        let bytes = send(SERVICE, self.client.get(&image_url), self.timeout_secs)
            .await?
            .bytes()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e, self.timeout_secs))?;
        if bytes.is_empty() {
            return Err(UpstreamError::InvalidResponse {
                service: SERVICE.to_string(),
                detail: "empty image".into(),
            });
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_is_comma_separated_points() {
        assert_eq!(
            rect_param(&Rect::new(49.5, 90.0, 316.25, 170.0)),
            "49.50,90.00,316.25,170.00"
        );
    }

    #[test]
    fn reply_prefers_urls_list() {
        let reply: ConvertResponse = serde_json::from_str(
            r#"{"error":false,"urls":["https://x/1.png"],"url":"https://x/other.png"}"#,
        )
        .unwrap();
        assert_eq!(reply.image_url().unwrap(), "https://x/1.png");

        let reply: ConvertResponse = serde_json::from_str(r#"{"url":"https://x/2.png"}"#).unwrap();
        assert_eq!(reply.image_url().unwrap(), "https://x/2.png");
    }

    #[test]
    fn error_reply_is_reported() {
        let reply: ConvertResponse =
            serde_json::from_str(r#"{"error":true,"message":"Invalid rect"}"#).unwrap();
        let err = reply.image_url().unwrap_err();
        assert!(err.to_string().contains("Invalid rect"));
    }

    #[test]
    fn missing_key_is_a_credential_error() {
        let err = PdfCoCropper::new(&ServiceSettings::new()).err().unwrap();
        assert!(matches!(
            err,
            IngestError::MissingCredential { env: "PDF_CO_API_KEY", .. }
        ));
    }
}
