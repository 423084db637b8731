use endless_types::{
    Amount, Challenge, ChallengeId, Eligibility, ErrorResponse, JoinRequest, JoinResponse,
    PlayerId, PrizePool,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the challenge service.
#[derive(Clone)]
pub struct Client {
    pub base_url: Url,
    pub http_client: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Joins a challenge for `player_id`, staking `amount`.
    ///
    /// A join inside the cooldown comes back as [`Error::TooEarly`].
    pub async fn join(&self, player_id: PlayerId, amount: Amount) -> Result<JoinResponse> {
        let request = JoinRequest::new(player_id, amount);
        let url = self.url("challenges")?;
        debug!(player_id, %amount, "joining challenge");
        self.send_json(self.http_client.post(url).json(&request), StatusCode::CREATED)
            .await
    }

    /// Newest challenges first, optionally only one player's.
    pub async fn challenges(
        &self,
        limit: Option<usize>,
        player_id: Option<PlayerId>,
    ) -> Result<Vec<Challenge>> {
        let mut url = self.url("challenges/results")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(player_id) = player_id {
                query.append_pair("player_id", &player_id.to_string());
            }
        }
        self.send_json(self.http_client.get(url), StatusCode::OK)
            .await
    }

    pub async fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>> {
        let url = self.url(&format!("challenges/{id}"))?;
        let response = self.http_client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response, StatusCode::OK).await.map(Some)
    }

    pub async fn eligibility(&self, player_id: PlayerId) -> Result<Eligibility> {
        let url = self.url(&format!("players/{player_id}/eligibility"))?;
        self.send_json(self.http_client.get(url), StatusCode::OK)
            .await
    }

    pub async fn prize_pool(&self) -> Result<PrizePool> {
        let url = self.url("prize-pool")?;
        self.send_json(self.http_client.get(url), StatusCode::OK)
            .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<T> {
        let response = request.send().await?;
        decode(response, expected).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, expected: StatusCode) -> Result<T> {
    let status = response.status();
    if status == expected {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 425 {
        if let Ok(ErrorResponse {
            retry_after_ms: Some(retry_after_ms),
            ..
        }) = serde_json::from_str::<ErrorResponse>(&body)
        {
            return Err(Error::TooEarly { retry_after_ms });
        }
    }
    Err(Error::FailedWithBody { status, body })
}
