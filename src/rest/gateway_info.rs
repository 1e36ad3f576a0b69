//! Gateway sizing hint (`GET /gateway/bot`)

use super::executor::{RequestPayload, RestExecutor};
use super::route::GET_GATEWAY_BOT;
use crate::error::RestError;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

impl SessionStartLimit {
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after)
    }
}

/// Where to connect and how many shards the server recommends
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GatewayBotInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

pub async fn fetch_gateway_bot(executor: &RestExecutor) -> Result<GatewayBotInfo, RestError> {
    let route = GET_GATEWAY_BOT.compile(&[])?;
    executor
        .execute(&route, &RequestPayload::default())
        .await?
        .json()
}
