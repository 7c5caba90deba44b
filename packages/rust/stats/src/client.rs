//! HTTP implementation of [`StatsProvider`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use kwengine_shared::{
    Device, DynamicsPeriod, DynamicsPoint, KwEngineError, RegionShare, Result, StatsConfig,
};

use crate::wire::{
    DynamicsBody, DynamicsResponse, RegionsBody, RegionsResponse, TopRequestsBody,
    TopRequestsResponse, wire_devices,
};
use crate::{DateRange, StatsProvider, VolumeReport};

/// User-Agent string for statistics requests.
const USER_AGENT: &str = concat!("kwengine/", env!("CARGO_PKG_VERSION"));

/// How much of an error body is kept in the error message.
const ERROR_BODY_SNIPPET: usize = 200;

/// Bearer-authenticated JSON client for the statistics service.
#[derive(Debug, Clone)]
pub struct StatsClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl StatsClient {
    /// Build a client against `base_url`. A `None` or blank token is allowed;
    /// every call then fails with an auth error without touching the network.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            KwEngineError::config(format!("invalid statistics base URL '{base_url}': {e}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| KwEngineError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Build a client from the `[stats]` config section.
    pub fn from_config(config: &StatsConfig, token: Option<String>) -> Result<Self> {
        Self::new(
            &config.base_url,
            token,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// POST a JSON body and decode the JSON answer, mapping failures onto the
    /// error taxonomy.
    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| KwEngineError::Auth("no bearer token configured".into()))?;

        let url = self
            .base_url
            .join(path)
            .map_err(|e| KwEngineError::config(format!("invalid endpoint path {path}: {e}")))?;

        let response = self
            .client
            .post(url.clone())
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KwEngineError::Upstream(format!("{url}: timed out"))
                } else {
                    KwEngineError::Upstream(format!("{url}: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| KwEngineError::Upstream(format!("{url}: failed to read body: {e}")))?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(KwEngineError::Auth(format!("{url}: HTTP {status}")));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(KwEngineError::Quota(format!("{url}: HTTP {status}")));
            }
            s if !s.is_success() => {
                return Err(KwEngineError::Upstream(format!(
                    "{url}: HTTP {status}: {}",
                    snippet(&text)
                )));
            }
            _ => {}
        }

        serde_json::from_str(&text).map_err(|e| {
            KwEngineError::MalformedResponse(format!("{url}: {e} (got: {})", snippet(&text)))
        })
    }
}

impl StatsProvider for StatsClient {
    fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    #[instrument(skip_all, fields(phrase = %phrase))]
    async fn fetch_volume(
        &self,
        phrase: &str,
        regions: &[u32],
        devices: &[Device],
    ) -> Result<VolumeReport> {
        let body = TopRequestsBody {
            phrase,
            regions,
            devices: wire_devices(devices),
        };
        let response: TopRequestsResponse = self.post("v1/topRequests", &body).await?;
        debug!(total_count = response.total_count, "volume fetched");

        Ok(VolumeReport {
            total_count: response.total_count,
            top_phrases: response.top_requests,
        })
    }

    #[instrument(skip_all, fields(phrase = %phrase))]
    async fn fetch_regional_breakdown(
        &self,
        phrase: &str,
        devices: &[Device],
    ) -> Result<Vec<RegionShare>> {
        let body = RegionsBody {
            phrase,
            devices: wire_devices(devices),
        };
        let response: RegionsResponse = self.post("v1/regions", &body).await?;
        Ok(response.results)
    }

    #[instrument(skip_all, fields(phrase = %phrase, from = %range.from, to = %range.to))]
    async fn fetch_dynamics(
        &self,
        phrase: &str,
        period: DynamicsPeriod,
        range: DateRange,
        devices: &[Device],
    ) -> Result<Vec<DynamicsPoint>> {
        let body = DynamicsBody::new(phrase, period, range.from, range.to, devices);
        let response: DynamicsResponse = self.post("v1/dynamics", &body).await?;
        Ok(response.results)
    }
}

/// First few characters of a body, for error messages.
fn snippet(text: &str) -> &str {
    match text.char_indices().nth(ERROR_BODY_SNIPPET) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> StatsClient {
        StatsClient::new(
            &server.uri(),
            Some("test-token".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_volume_sends_bearer_and_parses() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/topRequests"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_partial_json(serde_json::json!({
                "phrase": "тур в сочи",
                "regions": [213],
                "devices": ["DEVICE_PHONE"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requestPhrase": "тур в сочи",
                "totalCount": 15400,
                "topRequests": [
                    {"phrase": "тур в сочи", "count": 15400},
                    {"phrase": "тур в сочи все включено", "count": 3100}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let report = client
            .fetch_volume("тур в сочи", &[213], &[Device::Phone])
            .await
            .unwrap();

        assert_eq!(report.total_count, 15400);
        assert_eq!(report.top_phrases.len(), 2);
        assert_eq!(report.top_phrases[1].count, 3100);
    }

    #[tokio::test]
    async fn status_codes_map_to_error_kinds() {
        let server = MockServer::start().await;

        for (route, status) in [("/v1/topRequests", 401u16), ("/v1/regions", 429), ("/v1/dynamics", 503)] {
            Mock::given(method("POST"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;
        }

        let client = client_for(&server);

        let err = client.fetch_volume("x", &[], &[]).await.unwrap_err();
        assert!(matches!(err, KwEngineError::Auth(_)), "got {err:?}");

        let err = client.fetch_regional_breakdown("x", &[]).await.unwrap_err();
        assert!(matches!(err, KwEngineError::Quota(_)), "got {err:?}");

        let range = DateRange::lookback(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), 30);
        let err = client
            .fetch_dynamics("x", DynamicsPeriod::Weekly, range, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, KwEngineError::Upstream(_)), "got {err:?}");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn unexpected_payload_is_malformed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/topRequests"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_volume("x", &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, KwEngineError::MalformedResponse(_)), "got {err:?}");
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn missing_token_fails_without_request() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = StatsClient::new(&server.uri(), Some("   ".into()), Duration::from_secs(5))
            .unwrap();
        assert!(!client.has_credentials());

        let err = client.fetch_volume("x", &[], &[]).await.unwrap_err();
        assert!(matches!(err, KwEngineError::Auth(_)));
    }

    #[tokio::test]
    async fn regions_and_dynamics_parse() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/regions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requestPhrase": "тур",
                "results": [
                    {"regionId": 213, "count": 900, "share": 0.45, "affinityIndex": 130.5},
                    {"regionId": 2, "count": 300, "share": 0.15, "affinityIndex": 88.0}
                ]
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/dynamics"))
            .and(body_partial_json(serde_json::json!({
                "period": "PERIOD_DAILY",
                "fromDate": "2024-02-01",
                "toDate": "2024-03-02"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requestPhrase": "тур",
                "results": [
                    {"date": "2024-02-01", "count": 40, "share": 0.0001},
                    {"date": "2024-02-02", "count": 55, "share": 0.0002}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);

        let regions = client.fetch_regional_breakdown("тур", &[]).await.unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].region_id, 213);

        let range = DateRange {
            from: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };
        let points = client
            .fetch_dynamics("тур", DynamicsPeriod::Daily, range, &[])
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].count, 55);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client =
            StatsClient::new("https://stats.example.com/api", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.base_url.join("v1/regions").unwrap().as_str(),
            "https://stats.example.com/api/v1/regions"
        );
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let long = "ж".repeat(500);
        assert_eq!(snippet(&long).chars().count(), ERROR_BODY_SNIPPET);
        assert_eq!(snippet("short"), "short");
    }
}
