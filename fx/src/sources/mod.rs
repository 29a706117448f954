//! HTTP rate sources.

pub mod exchangerate_host;
pub mod frankfurter;

pub use exchangerate_host::ExchangeRateHostSource;
pub use frankfurter::FrankfurterSource;

use fxquote_common::Price;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{FxError, FxResult};

fn build_client(source_name: &str, timeout: Duration) -> FxResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FxError::Config(format!("failed to create {source_name} HTTP client: {e}")))
}

/// GET `url` and decode a JSON body. Non-2xx answers keep status and body.
async fn get_json<T: DeserializeOwned>(client: &Client, source_name: &str, url: &str) -> FxResult<T> {
    let response = client.get(url).send().await.map_err(|e| FxError::Http {
        source_name: source_name.to_string(),
        message: e.without_url().to_string(),
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| FxError::Http {
        source_name: source_name.to_string(),
        message: e.without_url().to_string(),
    })?;

    if !status.is_success() {
        return Err(FxError::Status {
            source_name: source_name.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    decode(source_name, &body)
}

fn decode<T: DeserializeOwned>(source_name: &str, body: &str) -> FxResult<T> {
    serde_json::from_str(body).map_err(|e| FxError::Decode {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })
}

/// Render a JSON number as a price without going through a lossy format.
fn price_from_number(source_name: &str, value: &serde_json::Number) -> FxResult<Price> {
    Price::parse(&value.to_string()).map_err(|e| FxError::InvalidPrice {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })
}
