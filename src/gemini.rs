// Client for the synchronous `generateContent` image endpoint. One call
// returns the whole answer; images come back either inline (base64) or
// as a markdown image link inside a text part.

use base64::prelude::*;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::GeminiConfig;
use crate::error::{ApiError, Result};

static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[.*?\]\(((?:https?://[^\s\)]+|data:image/[^;]+;base64,[^\s\)]+))\)")
        .expect("valid markdown image pattern")
});

static DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:image/([^;]+);base64,(.+)$").expect("valid data url pattern")
});

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, alias = "inline_data", skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, alias = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub image_config: ImageConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub aspect_ratio: String,
    pub image_size: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Content,
}

impl InlineData {
    /// Read an image from disk as a base64 inline part. The MIME type is
    /// guessed from the extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let mime = match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            _ => "image/png",
        };
        Ok(InlineData {
            mime_type: mime.to_string(),
            data: BASE64_STANDARD.encode(bytes),
        })
    }
}

/// Raw answer, kept whole so it can be archived even when it is an error.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub status: StatusCode,
    pub body: Value,
    pub latency: Duration,
}

impl RawReply {
    /// Non-2xx becomes an error carrying `error.message` when present.
    pub fn into_response(self) -> Result<GenerateResponse> {
        if !self.status.is_success() {
            let message = self
                .body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty());
            return Err(match message {
                Some(msg) => ApiError::Rejected(msg.to_string()),
                None => ApiError::Status {
                    status: self.status,
                    body: self.body.to_string(),
                },
            });
        }
        serde_json::from_value(self.body).map_err(|e| ApiError::Malformed(e.to_string()))
    }
}

/// Image found in a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedImage {
    Inline { ext: String, bytes: Vec<u8> },
    Remote(String),
}

/// Take the first usable image out of `candidates[0]`. Parts are tried in
/// order; a part that fails to decode does not stop the search.
pub fn extract_image(response: &GenerateResponse) -> Result<ExtractedImage> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| ApiError::Malformed("model returned no content".into()))?;

    let mut last_error = None;
    for part in &candidate.content.parts {
        if let Some(inline) = part.inline_data.as_ref().filter(|d| !d.data.is_empty()) {
            match BASE64_STANDARD.decode(inline.data.trim()) {
                Ok(bytes) => {
                    let ext = extension_for(inline.mime_type.rsplit('/').next().unwrap_or(""));
                    return Ok(ExtractedImage::Inline { ext, bytes });
                }
                Err(e) => {
                    last_error = Some(format!("inline image is not valid base64: {e}"));
                    continue;
                }
            }
        }

        let Some(url) = part.text.as_deref().and_then(markdown_image_url) else {
            continue;
        };
        if url.starts_with("data:image/") {
            match decode_data_url(url) {
                Ok(image) => return Ok(image),
                Err(e) => last_error = Some(e.to_string()),
            }
        } else {
            return Ok(ExtractedImage::Remote(url.to_string()));
        }
    }

    Err(ApiError::Malformed(match last_error {
        Some(e) => format!("request succeeded but the image could not be read: {e}"),
        None => "request succeeded but no image was returned".into(),
    }))
}

/// URL of the first `![..](url)` in `text`.
pub fn markdown_image_url(text: &str) -> Option<&str> {
    MARKDOWN_IMAGE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Decode `data:image/<fmt>;base64,<payload>`.
pub fn decode_data_url(url: &str) -> Result<ExtractedImage> {
    let caps = DATA_URL
        .captures(url)
        .ok_or_else(|| ApiError::Malformed("invalid base64 data url".into()))?;
    let bytes = BASE64_STANDARD
        .decode(&caps[2])
        .map_err(|e| ApiError::Malformed(format!("data url is not valid base64: {e}")))?;
    Ok(ExtractedImage::Inline {
        ext: extension_for(&caps[1]),
        bytes,
    })
}

/// File extension for an image subtype. Anything that is not a short
/// lowercase alphanumeric name falls back to `png`.
fn extension_for(subtype: &str) -> String {
    let subtype = subtype.trim().to_ascii_lowercase();
    match subtype.as_str() {
        "jpeg" => "jpg".into(),
        ext if (1..=5).contains(&ext.len()) && ext.bytes().all(|b| b.is_ascii_alphanumeric()) => subtype,
        _ => "png".into(),
    }
}

/// Blocking client for `generateContent`.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    url: String,
    api_key: String,
    aspect_ratio: String,
    image_size: String,
}

impl GeminiClient {
    pub fn from_config(config: &GeminiConfig) -> Result<Self> {
        let api_key = config.api_key()?.to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(GeminiClient {
            client,
            url: config.url.clone(),
            api_key,
            aspect_ratio: config.aspect_ratio.clone(),
            image_size: config.image_size.clone(),
        })
    }

    pub fn build_request(&self, prompt: &str, reference: Option<&InlineData>) -> GenerateRequest {
        let mut parts = vec![Part {
            text: Some(prompt.to_string()),
            inline_data: None,
        }];
        if let Some(image) = reference {
            parts.push(Part {
                text: None,
                inline_data: Some(image.clone()),
            });
        }
        GenerateRequest {
            contents: vec![Content {
                role: Some("user".into()),
                parts,
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE".into(), "TEXT".into()],
                image_config: ImageConfig {
                    aspect_ratio: self.aspect_ratio.clone(),
                    image_size: self.image_size.clone(),
                },
            },
        }
    }

    /// Send one request. Any HTTP status is returned as a `RawReply`;
    /// only transport failures are errors here.
    pub fn generate(&self, prompt: &str, reference: Option<&InlineData>) -> Result<RawReply> {
        let request = self.build_request(prompt, reference);
        let started = Instant::now();
        let res = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()?;
        let status = res.status();
        let text = res.text()?;
        let latency = started.elapsed();
        debug!(%status, latency_ms = latency.as_millis() as u64, "generateContent answered");
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(RawReply {
            status,
            body,
            latency,
        })
    }

    /// Fetch a remote image returned as a link.
    pub fn download(&self, url: &str) -> Result<Vec<u8>> {
        let res = self.client.get(url).send()?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(res.bytes()?.to_vec())
    }
}

/// Write `response_{index}.json`, four-space indented, creating `dir`.
pub fn save_response_json(dir: &Path, index: usize, body: &Value) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("response_{index}.json"));
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    body.serialize(&mut ser)?;
    let mut file = fs::File::create(&path)?;
    file.write_all(&buf)?;
    Ok(path)
}

/// Write `gen_{index}.{ext}` into `dir`.
pub fn save_image(dir: &Path, index: usize, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("gen_{index}.{ext}"));
    fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(parts: Value) -> GenerateResponse {
        serde_json::from_value(json!({ "candidates": [ { "content": { "parts": parts } } ] }))
            .unwrap()
    }

    #[test]
    fn request_uses_camel_case_fields() {
        let client = GeminiClient::from_config(&GeminiConfig {
            api_key: Some("k".into()),
            ..Default::default()
        })
        .unwrap();
        let image = InlineData {
            mime_type: "image/jpeg".into(),
            data: "AAAA".into(),
        };
        let body = serde_json::to_value(client.build_request("a llama", Some(&image))).unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a llama");
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(body["generationConfig"]["responseModalities"], json!(["IMAGE", "TEXT"]));
        assert_eq!(body["generationConfig"]["imageConfig"]["imageSize"], "2K");
    }

    #[test]
    fn inline_data_wins() {
        let resp = response(json!([
            { "text": "here you go" },
            { "inlineData": { "mimeType": "image/jpeg", "data": BASE64_STANDARD.encode(b"jpg!") } }
        ]));
        assert_eq!(
            extract_image(&resp).unwrap(),
            ExtractedImage::Inline { ext: "jpg".into(), bytes: b"jpg!".to_vec() }
        );
    }

    #[test]
    fn snake_case_inline_data_is_accepted() {
        let resp = response(json!([
            { "inline_data": { "mime_type": "image/png", "data": BASE64_STANDARD.encode(b"png") } }
        ]));
        assert!(matches!(extract_image(&resp).unwrap(), ExtractedImage::Inline { ext, .. } if ext == "png"));
    }

    #[test]
    fn markdown_links_and_data_urls() {
        let resp = response(json!([{ "text": "![image](https://cdn.example/x.png) done" }]));
        assert_eq!(
            extract_image(&resp).unwrap(),
            ExtractedImage::Remote("https://cdn.example/x.png".into())
        );

        let data_url = format!("![img](data:image/webp;base64,{})", BASE64_STANDARD.encode(b"webp"));
        let resp = response(json!([{ "text": data_url }]));
        assert_eq!(
            extract_image(&resp).unwrap(),
            ExtractedImage::Inline { ext: "webp".into(), bytes: b"webp".to_vec() }
        );
    }

    #[test]
    fn odd_subtypes_never_reach_the_file_name() {
        let resp = response(json!([{ "text": "![x](data:image/../../escaped;base64,QUJD)" }]));
        assert_eq!(
            extract_image(&resp).unwrap(),
            ExtractedImage::Inline { ext: "png".into(), bytes: b"ABC".to_vec() }
        );

        let resp = response(json!([
            { "inlineData": { "mimeType": "image/svg+xml", "data": BASE64_STANDARD.encode(b"svg") } }
        ]));
        assert!(matches!(extract_image(&resp).unwrap(), ExtractedImage::Inline { ext, .. } if ext == "png"));

        assert_eq!(extension_for("JPEG"), "jpg");
        assert_eq!(extension_for("webp"), "webp");
        assert_eq!(extension_for(""), "png");
    }

    #[test]
    fn bad_inline_data_falls_through_to_text() {
        let resp = response(json!([
            { "inlineData": { "mimeType": "image/png", "data": "***" } },
            { "text": "![image](https://cdn.example/y.jpg)" }
        ]));
        assert_eq!(
            extract_image(&resp).unwrap(),
            ExtractedImage::Remote("https://cdn.example/y.jpg".into())
        );
    }

    #[test]
    fn empty_answers_are_reported() {
        let err = extract_image(&GenerateResponse::default()).unwrap_err();
        assert!(err.to_string().contains("no content"));

        let err = extract_image(&response(json!([{ "text": "I cannot draw that" }]))).unwrap_err();
        assert!(err.to_string().contains("no image"));
    }

    #[test]
    fn error_reply_uses_error_message() {
        let reply = RawReply {
            status: StatusCode::FORBIDDEN,
            body: json!({ "error": { "message": "余额不足", "type": "quota" } }),
            latency: Duration::ZERO,
        };
        let err = reply.into_response().unwrap_err();
        assert!(matches!(&err, ApiError::Rejected(m) if m == "余额不足"));
        assert!(err.is_quota_error());
    }

    #[test]
    fn response_json_is_saved_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_response_json(dir.path(), 3, &json!({ "msg": "你好" })).unwrap();
        assert!(path.ends_with("response_3.json"));
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("    \"msg\": \"你好\""));
    }
}
