//! HTTP client for the comprehensive-analysis endpoint.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{info, warn};

use adscope_models::{AnalysisOutcome, FeatureResult};

use crate::error::{AnalysisError, AnalysisResult};

/// Feature name under which the comprehensive analysis reports its result.
pub const COMPREHENSIVE_ANALYSIS: &str = "comprehensive_analysis";

/// The analysis service can take minutes on video; 20 minutes covers the
/// worst observed case.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Analysis service configuration.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Base URL of the analysis service.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl AnalysisConfig {
    /// Create config from environment variables.
    pub fn from_env() -> AnalysisResult<Self> {
        let base_url = std::env::var("ANALYSIS_API_URL")
            .map_err(|_| AnalysisError::config_error("ANALYSIS_API_URL not set"))?;

        let timeout_secs: u64 = std::env::var("ANALYSIS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_secs());

        Ok(Self {
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Context fields forwarded with the media.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFields {
    /// What the ad is trying to say.
    pub ad_description: String,
    /// Funnel stage the ad targets.
    pub ad_type: String,
    /// Brand palette, comma-separated hex values.
    pub brand_colors: String,
    /// Brand tone of voice.
    pub tone_of_voice: String,
    /// Channels the ad will run on, as given by the caller.
    pub channels: Vec<String>,
    /// Signed URL of the brand logo, when one is on file.
    pub logo_url: Option<String>,
}

impl AnalysisFields {
    /// Map raw channel names onto the platform names the service expects.
    ///
    /// Unknown channels are dropped rather than guessed at.
    pub fn platforms(&self) -> Vec<&'static str> {
        self.channels
            .iter()
            .filter_map(|c| match c.to_lowercase().as_str() {
                "facebook" => Some("Facebook"),
                "instagram" => Some("Instagram"),
                "google ads" => Some("Google Ads"),
                "youtube" => Some("YouTube"),
                "tiktok" => Some("TikTok"),
                _ => None,
            })
            .collect()
    }
}

/// Client for the remote analysis service.
pub struct AnalysisClient {
    http: Client,
    base_url: String,
}

impl AnalysisClient {
    /// Create a new analysis client.
    pub fn new(config: AnalysisConfig) -> AnalysisResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("adscope-analysis/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> AnalysisResult<Self> {
        Self::new(AnalysisConfig::from_env()?)
    }

    /// Run the comprehensive analysis on a media file.
    ///
    /// Never fails at this level: timeouts, transport errors, and non-200
    /// responses all come back as failed feature results inside the
    /// outcome, so the caller's billing decision sees zero successes
    /// instead of an aborted request.
    pub async fn analyze(
        &self,
        media: Vec<u8>,
        filename: &str,
        content_type: &str,
        fields: &AnalysisFields,
    ) -> AnalysisOutcome {
        let url = format!("{}/comprehensive-analysis", self.base_url);

        let mut outcome = AnalysisOutcome::default();
        let result = match self.post_media(&url, media, filename, content_type, fields).await {
            Ok(result) => result,
            Err(e) => {
                warn!(url = %url, error = %e, "Analysis request failed");
                FeatureResult::failed(e.to_string())
            }
        };
        outcome.insert(COMPREHENSIVE_ANALYSIS, result);
        outcome
    }

    async fn post_media(
        &self,
        url: &str,
        media: Vec<u8>,
        filename: &str,
        content_type: &str,
        fields: &AnalysisFields,
    ) -> Result<FeatureResult, reqwest::Error> {
        let part = Part::bytes(media)
            .file_name(filename.to_string())
            .mime_str(content_type)?;

        let mut form = Form::new()
            .text("ad_description", fields.ad_description.clone())
            .text("user_ad_type", fields.ad_type.clone())
            .text("brand_colors", fields.brand_colors.clone())
            .text("tone_of_voice", fields.tone_of_voice.clone())
            .text("platforms", fields.platforms().join(","))
            .part("file", part);

        if let Some(logo_url) = &fields.logo_url {
            form = form.text("logo_url", logo_url.clone());
        }

        let response = self.http.post(url).multipart(form).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            // Non-JSON success bodies are kept verbatim
            let payload = serde_json::from_str(&body)
                .unwrap_or_else(|_| serde_json::Value::String(body));
            info!(url = %url, "Analysis succeeded");
            Ok(FeatureResult::ok(payload))
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "Analysis returned an error");
            Ok(FeatureResult::failed_with_status(body, status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AnalysisClient {
        AnalysisClient::new(AnalysisConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_platform_mapping_drops_unknown_channels() {
        let fields = AnalysisFields {
            channels: vec![
                "facebook".to_string(),
                "TikTok".to_string(),
                "carrier-pigeon".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(fields.platforms(), vec!["Facebook", "TikTok"]);
    }

    #[tokio::test]
    async fn test_analyze_success_parses_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/comprehensive-analysis"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 0.87})))
            .mount(&server)
            .await;

        let outcome = client_for(&server)
            .analyze(
                vec![1, 2, 3],
                "ad.png",
                "image/png",
                &AnalysisFields::default(),
            )
            .await;

        let verdict = outcome.verdict();
        assert!(verdict.is_billable());
        let result = &outcome.results[COMPREHENSIVE_ANALYSIS];
        assert_eq!(result.payload, Some(json!({"score": 0.87})));
    }

    #[tokio::test]
    async fn test_analyze_server_error_is_a_failed_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/comprehensive-analysis"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let outcome = client_for(&server)
            .analyze(
                vec![1, 2, 3],
                "ad.mp4",
                "video/mp4",
                &AnalysisFields::default(),
            )
            .await;

        assert!(!outcome.verdict().is_billable());
        let result = &outcome.results[COMPREHENSIVE_ANALYSIS];
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.error.as_deref(), Some("model crashed"));
    }

    #[tokio::test]
    async fn test_analyze_transport_error_degrades_to_failure() {
        // Point at a closed port: the request itself fails
        let client = AnalysisClient::new(AnalysisConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let outcome = client
            .analyze(vec![], "ad.png", "image/png", &AnalysisFields::default())
            .await;

        assert_eq!(outcome.verdict().succeeded, 0);
        assert!(outcome.results[COMPREHENSIVE_ANALYSIS].error.is_some());
    }
}
