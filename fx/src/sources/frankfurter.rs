//! Frankfurter (ECB reference rates) source.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use fxquote_common::CurrencyPair;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{build_client, get_json, price_from_number};
use crate::error::{FxError, FxResult};
use crate::provider::{RateQuote, RateSource};

pub const FRANKFURTER_BASE_URL: &str = "https://api.frankfurter.dev/v1";
const SOURCE_NAME: &str = "frankfurter";

#[derive(Debug, Deserialize)]
struct FrankfurterResponse {
    #[serde(default)]
    date: String,
    #[serde(default)]
    rates: HashMap<String, serde_json::Number>,
}

/// Rates from `GET {base_url}/latest?base=B&symbols=Q`.
pub struct FrankfurterSource {
    base_url: String,
    client: Client,
}

impl FrankfurterSource {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> FxResult<Self> {
        let base_url = base_url
            .filter(|u| !u.is_empty())
            .unwrap_or(FRANKFURTER_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            base_url,
            client: build_client(SOURCE_NAME, timeout)?,
        })
    }

    fn url(&self, pair: &CurrencyPair) -> String {
        format!(
            "{}/latest?base={}&symbols={}",
            self.base_url, pair.base, pair.quote
        )
    }
}

fn parse_response(response: FrankfurterResponse, pair: &CurrencyPair) -> FxResult<RateQuote> {
    let value = response
        .rates
        .get(pair.quote.code())
        .ok_or_else(|| FxError::MissingRate {
            source_name: SOURCE_NAME.to_string(),
            key: pair.quote.to_string(),
        })?;
    let price = price_from_number(SOURCE_NAME, value)?;

    // A daily fixing: the date stands for midnight UTC.
    let observed_at = NaiveDate::parse_from_str(&response.date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .unwrap_or_else(Utc::now);

    Ok(RateQuote::new(price, observed_at))
}

#[async_trait]
impl RateSource for FrankfurterSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<RateQuote> {
        debug!(pair = %pair, "Fetching rate from frankfurter");
        let response: FrankfurterResponse = get_json(&self.client, SOURCE_NAME, &self.url(pair)).await?;
        parse_response(response, pair)
    }
}
