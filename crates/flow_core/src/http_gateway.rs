//! reqwest-backed `ActionGateway` talking to the simulator backend.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{EquivalentCode, ParticipantId},
    error::ApiError,
    protocol::{
        ClearingRequest, ClearingResult, EquivalentQuery, ParticipantSummary, PaymentReceipt,
        PaymentRequest, PaymentTarget, PaymentTargetsQuery, TrustlineCloseRequest,
        TrustlineLimitRequest, TrustlineSummary,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::gateway::{ActionGateway, GatewayError, GatewayResult};

pub struct HttpActionGateway {
    http: Client,
    base_url: Url,
}

impl HttpActionGateway {
    pub fn new(server_url: &str, request_timeout: Option<Duration>) -> Result<Self> {
        // Trailing slash so relative endpoints join under any base path.
        let base_url = Url::parse(&format!("{}/", server_url.trim_end_matches('/')))
            .with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("server url must start with http:// or https://");
        }

        let mut builder = Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build http client")?;

        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> GatewayResult<Url> {
        self.base_url
            .join(path)
            .map_err(|err| GatewayError::new(format!("invalid endpoint {path}: {err}")))
    }

    async fn execute(&self, request: RequestBuilder) -> GatewayResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::new(format!("request failed: {err}")))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(failure_from_response(response).await)
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> GatewayResult<T> {
        let response = self.execute(request).await?;
        let status = response.status().as_u16();
        response.json::<T>().await.map_err(|err| {
            GatewayError::new(format!("malformed response body: {err}")).with_status(status)
        })
    }
}

async fn failure_from_response(response: Response) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => {
            debug!(status = status.as_u16(), code = ?api_error.code, "gateway: backend rejected request");
            GatewayError::from_api(Some(status.as_u16()), api_error)
        }
        Err(_) => {
            warn!(status = status.as_u16(), "gateway: unstructured error body");
            let detail = body.trim();
            let message = if detail.is_empty() {
                format!(
                    "request failed with status {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                )
                .trim_end()
                .to_string()
            } else {
                detail.to_string()
            };
            GatewayError::new(message).with_status(status.as_u16())
        }
    }
}

#[async_trait]
impl ActionGateway for HttpActionGateway {
    async fn send_payment(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
        amount: &str,
    ) -> GatewayResult<PaymentReceipt> {
        let url = self.endpoint("payments")?;
        let receipt: PaymentReceipt = self
            .execute_json(self.http.post(url).json(&PaymentRequest {
                equivalent: equivalent.clone(),
                from: from.clone(),
                to: to.clone(),
                amount: amount.to_string(),
            }))
            .await?;
        if receipt.is_rejected() {
            let status = receipt.status.as_deref().unwrap_or_default();
            warn!(tx = ?receipt.transaction_id, status, "gateway: payment not committed");
            return Err(GatewayError::new(format!("payment {}", status.to_ascii_lowercase())));
        }
        Ok(receipt)
    }

    async fn create_trustline(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
        limit: &str,
    ) -> GatewayResult<()> {
        let url = self.endpoint("trustlines")?;
        self.execute(self.http.post(url).json(&TrustlineLimitRequest {
            equivalent: equivalent.clone(),
            from: from.clone(),
            to: to.clone(),
            limit: limit.to_string(),
        }))
        .await?;
        Ok(())
    }

    async fn update_trustline(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
        new_limit: &str,
    ) -> GatewayResult<()> {
        let url = self.endpoint("trustlines")?;
        self.execute(self.http.patch(url).json(&TrustlineLimitRequest {
            equivalent: equivalent.clone(),
            from: from.clone(),
            to: to.clone(),
            limit: new_limit.to_string(),
        }))
        .await?;
        Ok(())
    }

    async fn close_trustline(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> GatewayResult<()> {
        let url = self.endpoint("trustlines/close")?;
        self.execute(self.http.post(url).json(&TrustlineCloseRequest {
            equivalent: equivalent.clone(),
            from: from.clone(),
            to: to.clone(),
        }))
        .await?;
        Ok(())
    }

    async fn run_clearing(&self, equivalent: &EquivalentCode) -> GatewayResult<ClearingResult> {
        let url = self.endpoint("clearing/run")?;
        self.execute_json(self.http.post(url).json(&ClearingRequest {
            equivalent: equivalent.clone(),
        }))
        .await
    }

    async fn fetch_participants(&self) -> GatewayResult<Vec<ParticipantSummary>> {
        let url = self.endpoint("participants")?;
        self.execute_json(self.http.get(url)).await
    }

    async fn fetch_trustlines(
        &self,
        equivalent: &EquivalentCode,
    ) -> GatewayResult<Vec<TrustlineSummary>> {
        let url = self.endpoint("trustlines")?;
        self.execute_json(self.http.get(url).query(&EquivalentQuery {
            equivalent: equivalent.clone(),
        }))
        .await
    }

    async fn fetch_payment_targets(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        max_hops: u8,
    ) -> GatewayResult<Vec<PaymentTarget>> {
        let url = self.endpoint("payment-targets")?;
        self.execute_json(self.http.get(url).query(&PaymentTargetsQuery {
            equivalent: equivalent.clone(),
            from: from.clone(),
            max_hops,
        }))
        .await
    }
}

#[cfg(test)]
#[path = "tests/http_gateway_tests.rs"]
mod tests;
