//! exchangerate.host source.

use async_trait::async_trait;
use chrono::Utc;
use fxquote_common::CurrencyPair;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{build_client, get_json, price_from_number};
use crate::error::{FxError, FxResult};
use crate::provider::{RateQuote, RateSource};

pub const EXCHANGERATE_HOST_BASE_URL: &str = "https://api.exchangerate.host";
const SOURCE_NAME: &str = "exchangerate_host";

#[derive(Debug, Deserialize)]
struct LiveResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    quotes: HashMap<String, serde_json::Number>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Rates from `GET {base_url}/live?access_key=K&source=B&currencies=Q`.
///
/// Quotes come back keyed by the concatenated pair, e.g. `EURMXN`.
pub struct ExchangeRateHostSource {
    base_url: String,
    access_key: String,
    client: Client,
}

impl ExchangeRateHostSource {
    pub fn new(base_url: Option<&str>, access_key: impl Into<String>, timeout: Duration) -> FxResult<Self> {
        let base_url = base_url
            .filter(|u| !u.is_empty())
            .unwrap_or(EXCHANGERATE_HOST_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            base_url,
            access_key: access_key.into(),
            client: build_client(SOURCE_NAME, timeout)?,
        })
    }

    fn url(&self, pair: &CurrencyPair) -> String {
        format!(
            "{}/live?access_key={}&source={}&currencies={}",
            self.base_url, self.access_key, pair.base, pair.quote
        )
    }
}

fn parse_response(response: LiveResponse, pair: &CurrencyPair) -> FxResult<RateQuote> {
    if !response.success {
        let detail = response
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "success=false".to_string());
        return Err(FxError::Rejected {
            source_name: SOURCE_NAME.to_string(),
            message: format!("{pair}: {detail}"),
        });
    }

    let key = format!("{}{}", pair.base, pair.quote);
    let value = response.quotes.get(&key).ok_or_else(|| FxError::MissingRate {
        source_name: SOURCE_NAME.to_string(),
        key: key.clone(),
    })?;

    Ok(RateQuote::new(price_from_number(SOURCE_NAME, value)?, Utc::now()))
}

#[async_trait]
impl RateSource for ExchangeRateHostSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<RateQuote> {
        debug!(pair = %pair, "Fetching rate from exchangerate.host");
        let response: LiveResponse = get_json(&self.client, SOURCE_NAME, &self.url(pair)).await?;
        parse_response(response, pair)
    }
}
