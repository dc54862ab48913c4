//! HTTP image classifier
//!
//! Posts the captured frame as a base64 data URL and expects a JSON object
//! back:
//!
//! ```json
//! {"category": "milk", "confidence": 0.93, "shelf_life_days": 7,
//!  "name": "Whole milk", "optimal_temp_c": 4}
//! ```
//!
//! `shelf_life_days` may also be a string ("5 days", "long-term") and the
//! temperature may carry a unit ("-18°C"). Responses wrapped in prose are
//! accepted as long as they contain one JSON object.

use crate::domain::error::RecognitionError;
use crate::domain::inventory::{ItemDescriptor, LONG_TERM_SHELF_LIFE_DAYS};
use crate::domain::types::ImageRef;
use crate::infra::config::Config;
use crate::services::recognition::Classifier;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const LONG_TERM_MARKERS: [&str; 8] =
    ["long-term", "long term", "indefinite", "permanent", "no expiry", "never", "长期", "永久"];

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    image_id: &'a str,
    image: String,
}

pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    default_shelf_life_days: u32,
}

impl HttpClassifier {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.recognition_attempt_timeout()).build()?;
        Ok(Self {
            http,
            endpoint: config.classifier_endpoint().to_string(),
            api_key: config.classifier_api_key().map(str::to_string),
            default_shelf_life_days: config.default_shelf_life_days(),
        })
    }

    async fn encode_image(image: &ImageRef) -> Result<String, RecognitionError> {
        let bytes = tokio::fs::read(&image.path).await.map_err(|e| {
            RecognitionError::Permanent(format!("cannot read {}: {e}", image.path.display()))
        })?;
        if bytes.is_empty() {
            return Err(RecognitionError::Permanent(format!("empty image {}", image.id)));
        }
        Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&bytes)))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn classify(&self, image: &ImageRef) -> Result<ItemDescriptor, RecognitionError> {
        let body = ClassifyRequest { image_id: &image.id, image: Self::encode_image(image).await? };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RecognitionError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RecognitionError::Transient(format!("classifier returned {status}")));
        }
        if !status.is_success() {
            return Err(RecognitionError::Permanent(format!("classifier returned {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| RecognitionError::Transient(format!("reading body failed: {e}")))?;
        debug!(image_id = %image.id, bytes = %text.len(), "classifier_response");

        parse_response(&text, self.default_shelf_life_days)
    }
}

/// Turn a classifier response body into a descriptor
pub fn parse_response(
    body: &str,
    default_shelf_life_days: u32,
) -> Result<ItemDescriptor, RecognitionError> {
    let value = extract_object(body)
        .ok_or_else(|| RecognitionError::Permanent("response contains no JSON object".into()))?;

    let category = value
        .get("category")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| RecognitionError::Permanent("response has no category".into()))?;

    let confidence = match value.get("confidence") {
        None | Some(Value::Null) => 1.0,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| RecognitionError::Permanent(format!("bad confidence {v}")))?
            as f32,
    };

    let shelf_life_days = value
        .get("shelf_life_days")
        .and_then(parse_shelf_life)
        .unwrap_or(default_shelf_life_days);

    let mut descriptor = ItemDescriptor::new(category, confidence, shelf_life_days);
    if let Some(name) = value.get("name").and_then(Value::as_str).filter(|n| !n.trim().is_empty()) {
        descriptor = descriptor.with_name(name.trim());
    }
    if let Some(temp) = value.get("optimal_temp_c").and_then(parse_temperature) {
        descriptor = descriptor.with_optimal_temp(temp);
    }
    Ok(descriptor)
}

fn extract_object(body: &str) -> Option<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&body[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Days from a number, a string with a leading number, or a long-term marker
pub fn parse_shelf_life(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => {
            let days = n.as_f64()?;
            (days > 0.0).then(|| days.ceil().min(f64::from(LONG_TERM_SHELF_LIFE_DAYS)) as u32)
        }
        Value::String(s) => {
            let lower = s.to_lowercase();
            if LONG_TERM_MARKERS.iter().any(|m| lower.contains(m)) {
                return Some(LONG_TERM_SHELF_LIFE_DAYS);
            }
            let digits: String =
                lower.chars().skip_while(|c| !c.is_ascii_digit()).take_while(char::is_ascii_digit).collect();
            let days: u32 = digits.parse().ok()?;
            let days = if lower.contains("week") {
                days.saturating_mul(7)
            } else if lower.contains("month") {
                days.saturating_mul(30)
            } else if lower.contains("year") {
                days.saturating_mul(365)
            } else {
                days
            };
            (days > 0).then_some(days.min(LONG_TERM_SHELF_LIFE_DAYS))
        }
        _ => None,
    }
}

/// Degrees Celsius from a number or a string such as "-18°C"
pub fn parse_temperature(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|t| t.is_finite()),
        Value::String(s) => {
            let start = s.find(|c: char| c.is_ascii_digit())?;
            let digits: String = s[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            let magnitude: f64 = digits.parse().ok()?;
            let negative = s[..start].trim_end().ends_with('-');
            Some(if negative { -magnitude } else { magnitude })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn classifier(server: &MockServer, dir: &TempDir) -> HttpClassifier {
        let config = Config::for_tests(dir.path());
        let mut classifier = HttpClassifier::new(&config).unwrap();
        classifier.endpoint = format!("{}/classify", server.uri());
        classifier
    }

    fn frame(dir: &TempDir, bytes: &[u8]) -> ImageRef {
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, bytes).unwrap();
        ImageRef::new("frame", path)
    }

    #[tokio::test]
    async fn test_successful_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "category": "milk",
                "confidence": 0.91,
                "shelf_life_days": 7,
                "name": "Whole milk",
                "optimal_temp_c": 4
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(&server, &dir);
        let descriptor = classifier.classify(&frame(&dir, &[0xFF, 0xD8, 0xFF, 0xD9])).await.unwrap();

        assert_eq!(descriptor.category, "milk");
        assert_eq!(descriptor.shelf_life_days, 7);
        assert_eq!(descriptor.name.as_deref(), Some("Whole milk"));
        assert!((descriptor.confidence - 0.91).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_api_key_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"category": "eggs"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut classifier = classifier(&server, &dir);
        classifier.api_key = Some("secret".to_string());
        let descriptor = classifier.classify(&frame(&dir, b"jpeg")).await.unwrap();
        assert_eq!(descriptor.category, "eggs");
        assert_eq!(descriptor.shelf_life_days, 7);
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = classifier(&server, &dir).classify(&frame(&dir, b"jpeg")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = classifier(&server, &dir).classify(&frame(&dir, b"jpeg")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = classifier(&server, &dir).classify(&frame(&dir, b"jpeg")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("I think this is cheese"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = classifier(&server, &dir).classify(&frame(&dir, b"jpeg")).await.unwrap_err();
        assert!(matches!(err, RecognitionError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_empty_image_is_permanent_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = classifier(&server, &dir).classify(&frame(&dir, b"")).await.unwrap_err();
        assert!(matches!(err, RecognitionError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = HttpClassifier::new(&Config::for_tests(dir.path())).unwrap();
        classifier.endpoint = "http://127.0.0.1:1/classify".to_string();
        let err = classifier.classify(&frame(&dir, b"jpeg")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_response_wrapped_in_prose() {
        let body = "Sure! Here it is: {\"category\": \"cheese\", \"shelf_life_days\": \"10 days\", \"optimal_temp_c\": \"2°C\"} Enjoy.";
        let descriptor = parse_response(body, 7).unwrap();
        assert_eq!(descriptor.category, "cheese");
        assert_eq!(descriptor.shelf_life_days, 10);
        assert_eq!(descriptor.optimal_temp_c, Some(2.0));
    }

    #[test]
    fn test_parse_response_clamps_confidence() {
        let descriptor = parse_response(r#"{"category": "ham", "confidence": 7.5}"#, 7).unwrap();
        assert_eq!(descriptor.confidence, 1.0);
    }

    #[test]
    fn test_parse_shelf_life_variants() {
        assert_eq!(parse_shelf_life(&json!(7)), Some(7));
        assert_eq!(parse_shelf_life(&json!(2.5)), Some(3));
        assert_eq!(parse_shelf_life(&json!(0)), None);
        assert_eq!(parse_shelf_life(&json!("5 days")), Some(5));
        assert_eq!(parse_shelf_life(&json!("about 2 weeks")), Some(14));
        assert_eq!(parse_shelf_life(&json!("Long-term")), Some(LONG_TERM_SHELF_LIFE_DAYS));
        assert_eq!(parse_shelf_life(&json!("长期")), Some(LONG_TERM_SHELF_LIFE_DAYS));
        assert_eq!(parse_shelf_life(&json!("soon")), None);
    }

    #[test]
    fn test_parse_temperature_variants() {
        assert_eq!(parse_temperature(&json!(-18)), Some(-18.0));
        assert_eq!(parse_temperature(&json!("-18°C")), Some(-18.0));
        assert_eq!(parse_temperature(&json!("4 C")), Some(4.0));
        assert_eq!(parse_temperature(&json!("cold")), None);
    }
}
