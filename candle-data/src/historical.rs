use crate::{
    candle::Candle,
    error::DataError,
    instrument::Instrument,
    reconcile::HistoricalFetcher,
    session::{Clock, MarketSession, minute_bucket},
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Default REST base url of the historical candle API.
pub const DEFAULT_BASE_URL: &str = "https://api.upstox.com";

/// [`HistoricalFetcher`] for the Upstox v2 one-minute candle REST API.
///
/// The current trading date is served by the intraday endpoint, earlier dates by the dated
/// endpoint:
/// - `GET /v2/historical-candle/intraday/{instrument_key}/1minute`
/// - `GET /v2/historical-candle/{instrument_key}/1minute/{to_date}/{from_date}`
///
/// ### Response
/// ```json
/// {
///     "status": "success",
///     "data": {
///         "candles": [
///             ["2024-06-03T09:16:00+05:30", 152.1, 152.4, 151.9, 152.35, 48210, 0],
///             ["2024-06-03T09:15:00+05:30", 151.8, 152.2, 151.5, 152.1, 91034, 0]
///         ]
///     }
/// }
/// ```
#[derive(Clone)]
pub struct UpstoxHistoricalFetcher {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
    session: MarketSession,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UpstoxHistoricalFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstoxHistoricalFetcher")
            .field("base_url", &self.base_url.as_str())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl UpstoxHistoricalFetcher {
    pub fn new(
        access_token: impl Into<String>,
        session: MarketSession,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DataError> {
        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|error| DataError::Config(format!("historical base url: {error}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            access_token: access_token.into(),
            session,
            clock,
        })
    }

    pub fn with_base_url(self, base_url: Url) -> Self {
        Self { base_url, ..self }
    }

    fn request_url(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Url, DataError> {
        let today = self.session.local_date(self.clock.now());
        let from_date = self.session.local_date(start);
        let to_date = self.session.local_date(end - TimeDelta::milliseconds(1));

        if self.base_url.cannot_be_a_base() {
            return Err(DataError::Config(format!(
                "historical base url cannot be a base: {}",
                self.base_url
            )));
        }

        // Instrument keys contain '|', which the API expects percent encoded
        let key = url::form_urlencoded::byte_serialize(instrument.key.as_str().as_bytes())
            .collect::<String>();
        let base_path = self.base_url.path().trim_end_matches('/');
        let path = if from_date == today && to_date == today {
            format!("{base_path}/v2/historical-candle/intraday/{key}/1minute")
        } else {
            format!(
                "{base_path}/v2/historical-candle/{key}/1minute/{}/{}",
                to_date.format("%Y-%m-%d"),
                from_date.format("%Y-%m-%d"),
            )
        };

        let mut url = self.base_url.clone();
        url.set_path(&path);
        Ok(url)
    }
}

#[async_trait]
impl HistoricalFetcher for UpstoxHistoricalFetcher {
    async fn fetch_intraday(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        if end <= start {
            return Ok(Vec::new());
        }

        let url = self.request_url(instrument, start, end)?;
        debug!(symbol = %instrument.symbol, %url, "fetching historical candles");

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DataError::NotFound(instrument.key.to_string()));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DataError::TransientNetwork(format!(
                "historical candles returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(DataError::Rejected(format!(
                "historical candles returned {status}"
            )));
        }

        let body = response.bytes().await?;
        let candles = parse_candles(&body, instrument)?;

        let mut candles = candles
            .into_iter()
            .filter(|candle| start <= candle.minute && candle.minute < end)
            .collect::<Vec<_>>();
        candles.sort_by_key(|candle| candle.minute);
        Ok(candles)
    }
}

#[derive(Deserialize)]
struct CandleResponse {
    data: CandleData,
}

#[derive(Deserialize)]
struct CandleData {
    #[serde(default)]
    candles: Vec<Vec<serde_json::Value>>,
}

/// Parse a candle response body, skipping malformed rows.
fn parse_candles(body: &[u8], instrument: &Instrument) -> Result<Vec<Candle>, DataError> {
    let response = serde_json::from_slice::<CandleResponse>(body)?;
    Ok(response
        .data
        .candles
        .iter()
        .filter_map(|row| {
            let candle = parse_row(row, instrument);
            if candle.is_none() {
                debug!(symbol = %instrument.symbol, ?row, "skipping malformed historical candle row");
            }
            candle
        })
        .collect())
}

/// `[timestamp, open, high, low, close, volume, open_interest]`
fn parse_row(row: &[serde_json::Value], instrument: &Instrument) -> Option<Candle> {
    let [timestamp, open, high, low, close, volume, ..] = row else {
        return None;
    };

    let timestamp = DateTime::parse_from_rfc3339(timestamp.as_str()?).ok()?;
    let date: NaiveDate = timestamp.date_naive();
    let minute = minute_bucket(timestamp.with_timezone(&Utc));
    let volume = volume
        .as_u64()
        .or_else(|| volume.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))?;

    let candle = Candle::historical(
        instrument.symbol.clone(),
        date,
        minute,
        open.as_f64()?,
        high.as_f64()?,
        low.as_f64()?,
        close.as_f64()?,
        volume,
    );
    candle.is_consistent().then_some(candle)
}
