use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use replay_core::{
    Action, DecisionContext, DecisionPayload, ReplayError, ReplayResult, SurrogatePredictor,
};

#[derive(Debug, Clone, Serialize)]
struct PredictRequest<'a> {
    pair: &'a str,
    timeframe: &'a str,
    features: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurrogatePrediction {
    pub probability: f64,
    #[serde(default)]
    pub expected_return: f64,
    pub recommendation: String,
}

fn unavailable(e: impl std::fmt::Display) -> ReplayError {
    ReplayError::SurrogateUnavailable(e.to_string())
}

/// Surrogate served by an external model service (`POST {base_url}/predict`).
#[derive(Clone)]
pub struct HttpSurrogate {
    client: reqwest::Client,
    base_url: String,
    model_version: String,
}

impl HttpSurrogate {
    /// `model_version` pins the service snapshot this run resolves against;
    /// it is recorded with every surrogate decision.
    pub fn new(
        base_url: impl Into<String>,
        model_version: impl Into<String>,
        timeout: Duration,
    ) -> ReplayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(unavailable)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_version: model_version.into(),
        })
    }
}

#[async_trait]
impl SurrogatePredictor for HttpSurrogate {
    async fn predict(&self, context: &DecisionContext) -> ReplayResult<DecisionPayload> {
        let request = PredictRequest {
            pair: &context.pair,
            timeframe: &context.timeframe,
            features: context.feature_map(),
        };

        let response = self
            .client
            .post(format!("{}/predict", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(ReplayError::SurrogateUnavailable(format!(
                "Status: {}",
                response.status()
            )));
        }

        let prediction = response
            .json::<SurrogatePrediction>()
            .await
            .map_err(unavailable)?;

        let action: Action = prediction
            .recommendation
            .parse()
            .map_err(|_| unavailable(format!("unknown recommendation '{}'", prediction.recommendation)))?;
        if !prediction.probability.is_finite() {
            return Err(unavailable("non-finite probability"));
        }

        Ok(DecisionPayload::new(
            action,
            prediction.probability.clamp(0.0, 1.0),
            format!(
                "model service {} (expected return {:+.4})",
                self.model_version, prediction.expected_return
            ),
        ))
    }

    fn model_version(&self) -> String {
        self.model_version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use replay_core::Feature;

    fn context() -> DecisionContext {
        DecisionContext {
            pair: "BTC/USDT".to_string(),
            timeframe: "15m".to_string(),
            last_observed_time: 1000,
            features: vec![Feature::new("rsi", 25.0)],
            feature_digest: String::new(),
        }
    }

    async fn spawn_service(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_maps_prediction() {
        let router = Router::new().route(
            "/predict",
            post(|Json(body): Json<serde_json::Value>| async move {
                let rsi = body["features"]["rsi"].as_f64().unwrap_or_default();
                let recommendation = if rsi < 30.0 { "BUY" } else { "HOLD" };
                Json(serde_json::json!({
                    "probability": 0.82,
                    "expected_return": 0.012,
                    "recommendation": recommendation,
                }))
            }),
        );
        let url = spawn_service(router).await;

        let surrogate = HttpSurrogate::new(url, "svc-v7", Duration::from_secs(2)).unwrap();
        let decision = surrogate.predict(&context()).await.unwrap();
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.confidence, 0.82);
        assert_eq!(surrogate.model_version(), "svc-v7");
    }

    #[tokio::test]
    async fn test_unknown_recommendation_unavailable() {
        let router = Router::new().route(
            "/predict",
            post(|| async {
                Json(serde_json::json!({"probability": 0.5, "recommendation": "maybe"}))
            }),
        );
        let url = spawn_service(router).await;

        let surrogate = HttpSurrogate::new(url, "svc-v7", Duration::from_secs(2)).unwrap();
        let err = surrogate.predict(&context()).await.unwrap_err();
        assert!(matches!(err, ReplayError::SurrogateUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service_unavailable() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let surrogate =
            HttpSurrogate::new(format!("http://{}", addr), "svc", Duration::from_millis(500))
                .unwrap();
        let err = surrogate.predict(&context()).await.unwrap_err();
        assert!(matches!(err, ReplayError::SurrogateUnavailable(_)));
    }
}
