use serde_json::Value;

use super::{GenerationResult, RequestFamily, VideoRequest};
use crate::core::error::GenerationError;
use crate::core::graph::MediaContent;

const MAX_ERROR_CHARS: usize = 200;

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn u32_field(value: &Value, keys: &[&str]) -> Option<u32> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_u64))
        .and_then(|v| u32::try_from(v).ok())
}

/// Guess a media type from the URL path, ignoring query strings.
fn guess_media_type(url: &str) -> Option<String> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or(url).to_string());
    mime_guess::from_path(path)
        .first()
        .filter(|m| matches!(m.type_().as_str(), "image" | "video"))
        .map(|m| m.essence_str().to_string())
}

/// Short, human error text from a provider error body.
pub(crate) fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            str_field(v, &["error", "message", "detail"]).map(str::to_string).or_else(|| {
                v.get("error")
                    .and_then(|e| str_field(e, &["message"]))
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| body.trim().to_string());
    let message = if message.is_empty() {
        "no details".to_string()
    } else {
        message
    };
    if message.chars().count() > MAX_ERROR_CHARS {
        let cut: String = message.chars().take(MAX_ERROR_CHARS).collect();
        format!("{}...", cut)
    } else {
        message
    }
}

/// Reads the produced media out of a 2xx provider answer. The URL lives
/// under `nodeData.generated.url` or `nodeData.url`.
pub fn parse_generation_response(body: &Value, family: RequestFamily) -> GenerationResult {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = str_field(body, &["error", "message"]).unwrap_or("request failed");
        return Err(GenerationError::malformed(reason));
    }
    let node_data = body
        .get("nodeData")
        .ok_or_else(|| GenerationError::malformed("response has no nodeData"))?;
    let generated = node_data.get("generated").filter(|g| g.is_object());

    let (source, url) = match generated.and_then(|g| str_field(g, &["url"]).map(|u| (g, u))) {
        Some(found) => found,
        None => match str_field(node_data, &["url"]) {
            Some(url) => (node_data, url),
            None => return Err(GenerationError::malformed("response has no media URL")),
        },
    };

    let media_type = str_field(source, &["type", "mimeType", "mediaType"])
        .or_else(|| str_field(node_data, &["type", "mimeType", "mediaType"]))
        .filter(|t| t.contains('/'))
        .map(str::to_string)
        .or_else(|| guess_media_type(url))
        .unwrap_or_else(|| family.default_media_type().to_string());

    let dimensions = source.get("dimensions").or_else(|| node_data.get("dimensions"));
    let dimension = |key: &'static str| {
        u32_field(source, &[key])
            .or_else(|| u32_field(node_data, &[key]))
            .or_else(|| dimensions.and_then(|d| u32_field(d, &[key])))
    };

    Ok(MediaContent {
        url: url.to_string(),
        media_type: Some(media_type),
        width: dimension("width"),
        height: dimension("height"),
        original_url: str_field(source, &["originalUrl"])
            .or_else(|| str_field(node_data, &["originalUrl"]))
            .map(str::to_string),
        local_path: str_field(source, &["localPath", "filePath"])
            .or_else(|| str_field(node_data, &["localPath", "filePath"]))
            .map(str::to_string),
    })
}

/// Splits a batch video answer `{results: [{nodeId, success, nodeData?,
/// error?}]}` into one result per request, matched by node id.
pub fn parse_batch_response(body: &Value, requests: &[VideoRequest]) -> Vec<GenerationResult> {
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    requests
        .iter()
        .map(|request| {
            let entry = results
                .iter()
                .find(|r| str_field(r, &["nodeId"]) == Some(request.node_id.as_str()))
                .ok_or_else(|| GenerationError::malformed("no result for this video"))?;
            if entry.get("success").and_then(Value::as_bool) == Some(false) {
                let message = str_field(entry, &["error"]).unwrap_or("video generation failed");
                let status = entry
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(502);
                return Err(GenerationError::ProviderRejected {
                    status,
                    message: message.to_string(),
                });
            }
            parse_generation_response(entry, RequestFamily::ImageToVideo)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_generated_url_with_dimensions() {
        let body = json!({
            "success": true,
            "nodeData": {
                "generated": {"url": "https://cdn/x.webp", "width": 1024, "height": 576,
                              "originalUrl": "https://raw/x.png"}
            }
        });
        let content = parse_generation_response(&body, RequestFamily::TextToImage).unwrap();
        assert_eq!(content.url, "https://cdn/x.webp");
        assert_eq!(content.media_type.as_deref(), Some("image/webp"));
        assert_eq!((content.width, content.height), (Some(1024), Some(576)));
        assert_eq!(content.original_url.as_deref(), Some("https://raw/x.png"));
    }

    #[test]
    fn falls_back_to_node_data_url() {
        let body = json!({"nodeData": {"url": "https://cdn/clip?sig=1", "type": "video/mp4",
                                        "localPath": "/tmp/clip.mp4"}});
        let content = parse_generation_response(&body, RequestFamily::ImageToVideo).unwrap();
        assert_eq!(content.url, "https://cdn/clip?sig=1");
        assert_eq!(content.media_type.as_deref(), Some("video/mp4"));
        assert_eq!(content.local_path.as_deref(), Some("/tmp/clip.mp4"));
    }

    #[test]
    fn unknown_extension_uses_family_default() {
        let body = json!({"nodeData": {"generated": {"url": "https://cdn/blob"}}});
        let content = parse_generation_response(&body, RequestFamily::ImageToVideo).unwrap();
        assert_eq!(content.media_type.as_deref(), Some("video/mp4"));
    }

    #[test]
    fn success_without_url_is_malformed() {
        let body = json!({"success": true, "nodeData": {"generated": {}}});
        let err = parse_generation_response(&body, RequestFamily::ImageEdit).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::ProviderMalformed);
    }

    #[test]
    fn error_message_prefers_json_fields_and_truncates() {
        assert_eq!(error_message(r#"{"error": "quota exceeded"}"#), "quota exceeded");
        assert_eq!(
            error_message(r#"{"error": {"message": "bad model"}}"#),
            "bad model"
        );
        let long = "x".repeat(500);
        assert_eq!(error_message(&long).chars().count(), MAX_ERROR_CHARS + 3);
        assert_eq!(error_message("   "), "no details");
    }

    #[test]
    fn batch_results_are_matched_by_node_id() {
        let request = |id: &str| VideoRequest {
            node_id: id.into(),
            prompt: "p".into(),
            images: Vec::new(),
            duration: 5,
            aspect_ratio: "16:9".into(),
            model: "m".into(),
            test_mode: false,
        };
        let requests = vec![request("v1"), request("v2"), request("v3")];
        let body = json!({"results": [
            {"nodeId": "v2", "success": false, "error": "nsfw"},
            {"nodeId": "v1", "success": true, "nodeData": {"url": "https://cdn/v1.mp4"}}
        ]});
        let results = parse_batch_response(&body, &requests);
        assert_eq!(results[0].as_ref().unwrap().url, "https://cdn/v1.mp4");
        assert!(matches!(
            results[1],
            Err(GenerationError::ProviderRejected { .. })
        ));
        assert!(matches!(
            results[2],
            Err(GenerationError::ProviderMalformed(_))
        ));
    }
}
