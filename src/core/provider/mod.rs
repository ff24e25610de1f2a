//! Provider transports: the request shapes sent to image and video model
//! endpoints and the trait every transport implements.

mod http;
mod response;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::GenerationError;
use crate::core::graph::{MediaContent, NodeId};

pub use http::{Endpoints, HttpTransport, RetryPolicy};
pub use response::{parse_batch_response, parse_generation_response};

/// Endpoint family a request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestFamily {
    TextToImage,
    ImageEdit,
    ImageToVideo,
}

impl RequestFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestFamily::TextToImage => "text-to-image",
            RequestFamily::ImageEdit => "image-edit",
            RequestFamily::ImageToVideo => "image-to-video",
        }
    }

    /// Media type assumed when neither the provider nor the URL tell.
    pub fn default_media_type(self) -> &'static str {
        match self {
            RequestFamily::TextToImage | RequestFamily::ImageEdit => "image/png",
            RequestFamily::ImageToVideo => "video/mp4",
        }
    }
}

/// Model set selected per run: fast/cheap models for tests, higher-quality
/// models otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    Test,
    #[default]
    Normal,
}

impl ModelProfile {
    pub fn is_test(self) -> bool {
        self == ModelProfile::Test
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSet {
    pub text_to_image: String,
    pub image_edit: String,
    pub image_to_video: String,
}

impl ModelSet {
    pub fn model_for(&self, family: RequestFamily) -> &str {
        match family {
            RequestFamily::TextToImage => &self.text_to_image,
            RequestFamily::ImageEdit => &self.image_edit,
            RequestFamily::ImageToVideo => &self.image_to_video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default = "default_test_models")]
    pub test: ModelSet,
    #[serde(default = "default_normal_models")]
    pub normal: ModelSet,
}

fn default_test_models() -> ModelSet {
    ModelSet {
        text_to_image: "flux-schnell".to_string(),
        image_edit: "flux-kontext-dev".to_string(),
        image_to_video: "seedance-1-lite".to_string(),
    }
}

fn default_normal_models() -> ModelSet {
    ModelSet {
        text_to_image: "seedream-4".to_string(),
        image_edit: "nano-banana".to_string(),
        image_to_video: "kling-v2.1".to_string(),
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            test: default_test_models(),
            normal: default_normal_models(),
        }
    }
}

impl ModelCatalog {
    pub fn for_profile(&self, profile: ModelProfile) -> &ModelSet {
        match profile {
            ModelProfile::Test => &self.test,
            ModelProfile::Normal => &self.normal,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextToImageRequest {
    pub node_id: NodeId,
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "is_false")]
    pub test_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEditRequest {
    pub node_id: NodeId,
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: String,
    pub source_images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "is_false")]
    pub test_mode: bool,
}

/// How a source image is used by a video model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameRole {
    FirstFrame,
    LastFrame,
    Character,
    Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoImage {
    pub url: String,
    #[serde(rename = "type")]
    pub role: FrameRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRequest {
    pub node_id: NodeId,
    pub prompt: String,
    pub images: Vec<VideoImage>,
    pub duration: u32,
    pub aspect_ratio: String,
    pub model: String,
    #[serde(skip_serializing_if = "is_false")]
    pub test_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderRequest {
    TextToImage(TextToImageRequest),
    ImageEdit(ImageEditRequest),
    ImageToVideo(VideoRequest),
}

impl ProviderRequest {
    pub fn family(&self) -> RequestFamily {
        match self {
            ProviderRequest::TextToImage(_) => RequestFamily::TextToImage,
            ProviderRequest::ImageEdit(_) => RequestFamily::ImageEdit,
            ProviderRequest::ImageToVideo(_) => RequestFamily::ImageToVideo,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            ProviderRequest::TextToImage(r) => &r.node_id,
            ProviderRequest::ImageEdit(r) => &r.node_id,
            ProviderRequest::ImageToVideo(r) => &r.node_id,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderRequest::TextToImage(r) => &r.model,
            ProviderRequest::ImageEdit(r) => &r.model,
            ProviderRequest::ImageToVideo(r) => &r.model,
        }
    }

    pub fn body(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            ProviderRequest::TextToImage(r) => serde_json::to_value(r),
            ProviderRequest::ImageEdit(r) => serde_json::to_value(r),
            ProviderRequest::ImageToVideo(r) => serde_json::to_value(r),
        }
    }
}

pub type GenerationResult = Result<MediaContent, GenerationError>;

/// One video's answer in a batch, keyed by the node it was generated for.
pub type BatchResult = (NodeId, GenerationResult);

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Submits one job and returns the produced media.
    async fn submit(&self, request: &ProviderRequest) -> GenerationResult;

    /// Submits several video jobs in one call. Results are keyed by node id
    /// and may come back in any order; a request without a result is
    /// treated as malformed by the caller. `None` when the transport has no
    /// batch endpoint; callers then fall back to individual submissions.
    async fn submit_video_batch(
        &self,
        _requests: &[VideoRequest],
        _max_concurrency: usize,
    ) -> Option<Vec<BatchResult>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_to_image_body_matches_wire_contract() {
        let request = ProviderRequest::TextToImage(TextToImageRequest {
            node_id: "n1".into(),
            prompt: "a fox".into(),
            model: "flux-schnell".into(),
            aspect_ratio: "1:1".into(),
            seed: None,
            test_mode: true,
        });
        assert_eq!(
            request.body().unwrap(),
            json!({
                "nodeId": "n1",
                "prompt": "a fox",
                "model": "flux-schnell",
                "aspectRatio": "1:1",
                "testMode": true
            })
        );
    }

    #[test]
    fn video_body_carries_typed_images() {
        let request = ProviderRequest::ImageToVideo(VideoRequest {
            node_id: "v".into(),
            prompt: "action".into(),
            images: vec![VideoImage {
                url: "https://cdn/a.png".into(),
                role: FrameRole::FirstFrame,
                original_url: Some("https://raw/a.png".into()),
            }],
            duration: 10,
            aspect_ratio: "16:9".into(),
            model: "kling-v2.1".into(),
            test_mode: false,
        });
        let body = request.body().unwrap();
        assert_eq!(
            body["images"],
            json!([{"url": "https://cdn/a.png", "type": "first_frame", "originalUrl": "https://raw/a.png"}])
        );
        assert!(body.get("testMode").is_none());
        assert_eq!(request.family(), RequestFamily::ImageToVideo);
    }

    #[test]
    fn profiles_pick_distinct_models() {
        let catalog = ModelCatalog::default();
        assert_ne!(
            catalog.for_profile(ModelProfile::Test).text_to_image,
            catalog.for_profile(ModelProfile::Normal).text_to_image
        );
        assert_eq!(
            catalog
                .for_profile(ModelProfile::Normal)
                .model_for(RequestFamily::ImageEdit),
            "nano-banana"
        );
    }
}
