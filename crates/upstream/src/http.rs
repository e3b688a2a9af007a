//! HTTP implementation of the upstream collaborator.
//!
//! Every call goes through `HttpUpstream::request`, which resolves the
//! per-region base URL, attaches the session token as a bearer credential and
//! returns the parsed JSON body. Responses wrapped in a `data` envelope are
//! unwrapped before decoding typed payloads.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::{RegionCode, mask_token};
use reqwest::{Method, Url};
use tracing::debug;

use crate::error::{Error, Result};
use crate::{CapabilitySnapshot, Credit, Upstream};

/// Paths of the upstream endpoints the pool relies on.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoints {
    pub liveness_path: String,
    pub credit_path: String,
    pub receive_credit_path: String,
    pub capabilities_path: String,
}

impl Default for UpstreamEndpoints {
    fn default() -> Self {
        Self {
            liveness_path: "/passport/account/info/v2".to_string(),
            credit_path: "/commerce/v1/benefits/user_credit".to_string(),
            receive_credit_path: "/commerce/v1/benefits/credit_receive".to_string(),
            capabilities_path: "/mweb/v1/get_common_config".to_string(),
        }
    }
}

/// Extra request parameters for `HttpUpstream::request`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// Upstream client addressing one base URL per region.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_urls: HashMap<RegionCode, String>,
    endpoints: UpstreamEndpoints,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(
        client: reqwest::Client,
        base_urls: HashMap<RegionCode, String>,
        endpoints: UpstreamEndpoints,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_urls,
            endpoints,
            timeout,
        }
    }

    /// Issue one upstream call on behalf of `token` in `region`.
    ///
    /// 401/403 map to `Error::Unauthorized`, any other non-2xx status to
    /// `Error::Status`. An empty 2xx body yields `Value::Null`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: &str,
        region: RegionCode,
        options: RequestOptions,
    ) -> Result<serde_json::Value> {
        let base = self
            .base_urls
            .get(&region)
            .ok_or(Error::RegionNotConfigured(region))?;

        let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
            .map_err(|e| Error::Http(format!("invalid upstream url: {e}")))?;
        if !options.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &options.query {
                pairs.append_pair(key, value);
            }
        }

        debug!(%method, path, %region, token = %mask_token(token), "upstream request");

        let mut builder = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .timeout(self.timeout);
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("upstream request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| Error::Decode(format!("{path}: {e}")))
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        region: RegionCode,
    ) -> Result<T> {
        let value = self
            .request(method, path, token, region, RequestOptions::default())
            .await?;
        serde_json::from_value(unwrap_data(value)).map_err(|e| Error::Decode(format!("{path}: {e}")))
    }
}

/// Strip a `{ "data": ... }` envelope when present.
fn unwrap_data(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

impl Upstream for HttpUpstream {
    fn id(&self) -> &str {
        "http"
    }

    fn token_live_status<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            match self
                .request(
                    Method::POST,
                    &self.endpoints.liveness_path,
                    token,
                    region,
                    RequestOptions::default(),
                )
                .await
            {
                Ok(_) => Ok(true),
                Err(Error::Unauthorized { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn credit<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<Credit>> + Send + 'a>> {
        Box::pin(async move {
            self.fetch(Method::POST, &self.endpoints.credit_path, token, region)
                .await
        })
    }

    fn receive_credit<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<Credit>> + Send + 'a>> {
        Box::pin(async move {
            self.request(
                Method::POST,
                &self.endpoints.receive_credit_path,
                token,
                region,
                RequestOptions::default(),
            )
            .await?;
            self.credit(token, region).await
        })
    }

    fn capabilities<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<CapabilitySnapshot>> + Send + 'a>> {
        Box::pin(async move {
            self.fetch(Method::GET, &self.endpoints.capabilities_path, token, region)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};

    /// Start a mock upstream. Sessions named `good` are accepted, `revoked`
    /// gets 403, anything else gets 500.
    async fn start_mock_upstream() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        fn session(headers: &HeaderMap) -> String {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .unwrap_or("")
                .to_string()
        }

        let app = axum::Router::new()
            .route(
                "/passport/account/info/v2",
                post(|headers: HeaderMap| async move {
                    match session(&headers).as_str() {
                        "good" => (StatusCode::OK, "{\"user_id\": 1}"),
                        "revoked" => (StatusCode::FORBIDDEN, "{}"),
                        _ => (StatusCode::INTERNAL_SERVER_ERROR, "boom"),
                    }
                }),
            )
            .route(
                "/commerce/v1/benefits/user_credit",
                post(|| async {
                    "{\"data\": {\"giftCredit\": 60, \"purchaseCredit\": 0, \"vipCredit\": 20}}"
                }),
            )
            .route(
                "/mweb/v1/get_common_config",
                get(|| async { "{\"videoModels\": [\"v3\"], \"capabilityTags\": [\"multi_ref\"]}" }),
            );

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    fn upstream_for(base: &str) -> HttpUpstream {
        HttpUpstream::new(
            reqwest::Client::new(),
            HashMap::from([(RegionCode::Us, base.to_string())]),
            UpstreamEndpoints::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn live_status_accepts_good_session() {
        let (base, _server) = start_mock_upstream().await;
        let upstream = upstream_for(&base);
        assert!(upstream.token_live_status("good", RegionCode::Us).await.unwrap());
    }

    #[tokio::test]
    async fn live_status_reports_rejected_session_as_not_live() {
        let (base, _server) = start_mock_upstream().await;
        let upstream = upstream_for(&base);
        assert!(!upstream.token_live_status("revoked", RegionCode::Us).await.unwrap());
    }

    #[tokio::test]
    async fn live_status_propagates_server_errors() {
        let (base, _server) = start_mock_upstream().await;
        let upstream = upstream_for(&base);
        let err = upstream
            .token_live_status("other", RegionCode::Us)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status { status: 500, .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn credit_unwraps_data_envelope() {
        let (base, _server) = start_mock_upstream().await;
        let upstream = upstream_for(&base);
        let credit = upstream.credit("good", RegionCode::Us).await.unwrap();
        assert_eq!(credit.gift_credit, 60);
        assert_eq!(credit.total(), 80);
    }

    #[tokio::test]
    async fn capabilities_decode_partial_snapshot() {
        let (base, _server) = start_mock_upstream().await;
        let upstream = upstream_for(&base);
        let caps = upstream.capabilities("good", RegionCode::Us).await.unwrap();
        assert_eq!(caps.video_models, Some(vec!["v3".to_string()]));
        assert!(caps.image_models.is_none());
        assert_eq!(caps.capability_tags, Some(vec!["multi_ref".to_string()]));
    }

    #[tokio::test]
    async fn unconfigured_region_fails_without_network() {
        let upstream = upstream_for("http://127.0.0.1:9");
        let err = upstream
            .token_live_status("good", RegionCode::Jp)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegionNotConfigured(RegionCode::Jp)));
        assert_eq!(err.kind(), "region_not_configured");
    }

    #[test]
    fn unwrap_data_leaves_plain_objects_alone() {
        let plain = serde_json::json!({"giftCredit": 1});
        assert_eq!(unwrap_data(plain.clone()), plain);
        let wrapped = serde_json::json!({"data": {"giftCredit": 2}});
        assert_eq!(unwrap_data(wrapped), serde_json::json!({"giftCredit": 2}));
    }
}
