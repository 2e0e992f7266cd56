use super::{FeedConnection, FeedConnector, FeedControl};
use crate::{error::DataError, instrument::InstrumentKey, tick::Tick};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fnv::FnvHashMap;
use futures::{Sink, SinkExt, StreamExt, stream};
use serde::{Deserialize, Deserializer, Serialize, de};
use parking_lot::Mutex;
use std::{fmt::Display, str::FromStr, sync::Arc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};
use url::Url;

/// Where the live feed WebSocket URL comes from.
#[derive(Clone, Debug)]
pub enum FeedEndpoint {
    /// Connect straight to a known URL.
    Direct(Url),
    /// Ask an HTTP authorise endpoint for a single use feed URL before every connection.
    Authorize { url: Url, access_token: String },
}

/// [`FeedConnector`] for a JSON over WebSocket last-traded-price feed.
///
/// ### Subscription Frame
/// ```json
/// {"guid":"9f1c2a7b3e4d5f60","method":"sub","data":{"mode":"ltpc","instrumentKeys":["NSE_EQ|INE081A01020"]}}
/// ```
///
/// ### Tick Frame
/// ```json
/// {
///     "feeds": {
///         "NSE_EQ|INE081A01020": {
///             "ltpc": { "ltp": 152.35, "ltt": "1717389017000", "ltq": "50000" },
///             "seq": 1042
///         }
///     }
/// }
/// ```
///
/// `seq` is optional, entries published without one are numbered by a [`SequenceStamper`].
#[derive(Clone, Debug)]
pub struct WebSocketFeedConnector {
    endpoint: FeedEndpoint,
    http: reqwest::Client,
    sequences: Arc<Mutex<SequenceStamper>>,
}

impl WebSocketFeedConnector {
    pub fn direct(url: Url) -> Self {
        Self {
            endpoint: FeedEndpoint::Direct(url),
            http: reqwest::Client::new(),
            sequences: Arc::default(),
        }
    }

    pub fn authorized(authorize_url: Url, access_token: impl Into<String>) -> Self {
        Self {
            endpoint: FeedEndpoint::Authorize {
                url: authorize_url,
                access_token: access_token.into(),
            },
            http: reqwest::Client::new(),
            sequences: Arc::default(),
        }
    }

    async fn feed_url(&self) -> Result<Url, DataError> {
        let (url, access_token) = match &self.endpoint {
            FeedEndpoint::Direct(url) => return Ok(url.clone()),
            FeedEndpoint::Authorize { url, access_token } => (url, access_token),
        };

        #[derive(Deserialize)]
        struct AuthorizeResponse {
            data: AuthorizeData,
        }

        #[derive(Deserialize)]
        struct AuthorizeData {
            authorized_redirect_uri: String,
        }

        let response = self
            .http
            .get(url.clone())
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DataError::TransientNetwork(format!(
                "feed authorise returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(DataError::Rejected(format!("feed authorise returned {status}")));
        }

        let body = response.json::<AuthorizeResponse>().await?;
        Url::parse(&body.data.authorized_redirect_uri)
            .map_err(|error| DataError::Deserialise(format!("authorised feed url: {error}")))
    }
}

#[async_trait]
impl FeedConnector for WebSocketFeedConnector {
    async fn connect(&self) -> Result<FeedConnection, DataError> {
        let url = self.feed_url().await?;
        let (websocket, _) = connect_async(url.as_str()).await?;
        info!(host = url.host_str().unwrap_or_default(), "feed websocket connected");

        // Shared across connections, stamped sequences keep increasing after a reconnect
        let sequences = Arc::clone(&self.sequences);
        let (sink, messages) = websocket.split();
        let ticks = messages
            .flat_map(move |message| stream::iter(decode_message(message, &mut sequences.lock())))
            .boxed();

        Ok(FeedConnection {
            control: Box::new(WebSocketControl { sink }),
            ticks,
        })
    }
}

struct WebSocketControl<S> {
    sink: S,
}

impl<S> WebSocketControl<S>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    async fn send(
        &mut self,
        method: &'static str,
        instruments: &[InstrumentKey],
    ) -> Result<(), DataError> {
        let frame = ControlFrame::new(method, instruments);
        let payload = serde_json::to_vec(&frame)?;
        self.sink.send(Message::binary(payload)).await?;
        debug!(method, topics = instruments.len(), guid = %frame.guid, "sent feed control frame");
        Ok(())
    }
}

#[async_trait]
impl<S> FeedControl for WebSocketControl<S>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError> {
        self.send("sub", instruments).await
    }

    async fn unsubscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError> {
        self.send("unsub", instruments).await
    }
}

#[derive(Serialize)]
struct ControlFrame<'a> {
    guid: String,
    method: &'static str,
    data: ControlData<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlData<'a> {
    mode: &'static str,
    instrument_keys: &'a [InstrumentKey],
}

impl<'a> ControlFrame<'a> {
    fn new(method: &'static str, instruments: &'a [InstrumentKey]) -> Self {
        Self {
            guid: format!("{:016x}", rand::random::<u64>()),
            method,
            data: ControlData {
                mode: "ltpc",
                instrument_keys: instruments,
            },
        }
    }
}

#[derive(Deserialize)]
struct FeedFrame {
    #[serde(default)]
    feeds: FnvHashMap<String, FeedEntry>,
}

#[derive(Deserialize)]
struct FeedEntry {
    ltpc: Option<Ltpc>,
    #[serde(default, deserialize_with = "de_opt_str_or_number")]
    seq: Option<u64>,
}

#[derive(Deserialize)]
struct Ltpc {
    #[serde(default, deserialize_with = "de_opt_str_or_number")]
    ltp: Option<f64>,
    /// Last traded time, epoch milliseconds.
    #[serde(default, deserialize_with = "de_opt_str_or_number")]
    ltt: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_str_or_number")]
    ltq: Option<u64>,
}

impl FeedEntry {
    fn into_tick(self, key: &str, sequences: &mut SequenceStamper) -> Option<Tick> {
        let ltpc = self.ltpc?;
        let ltt = ltpc.ltt?;
        let time = Utc.timestamp_millis_opt(ltt).single()?;
        let price = ltpc.ltp?;
        let quantity = ltpc.ltq?;
        let sequence = match self.seq {
            Some(sequence) => sequence,
            None => sequences.stamp(key, ltt, price, quantity),
        };

        Some(Tick {
            instrument: InstrumentKey::new(key),
            time,
            price,
            quantity,
            sequence,
        })
    }
}

/// Numbers feed entries that carry no `seq` of their own.
///
/// Numbers are monotonic per instrument for the lifetime of the connector. An entry repeating
/// the previous trade of its instrument (same `ltt`, `ltp` and `ltq`, eg/ the snapshot re-sent
/// after a reconnect) is given the previous number again, so the dispatcher drops it as a
/// duplicate.
#[derive(Debug, Default)]
pub struct SequenceStamper {
    instruments: FnvHashMap<String, StampedTrade>,
}

#[derive(Debug)]
struct StampedTrade {
    trade: (i64, u64, u64),
    sequence: u64,
}

impl SequenceStamper {
    pub fn stamp(&mut self, instrument: &str, ltt: i64, price: f64, quantity: u64) -> u64 {
        let trade = (ltt, price.to_bits(), quantity);
        match self.instruments.get_mut(instrument) {
            Some(last) if last.trade == trade => last.sequence,
            Some(last) => {
                last.trade = trade;
                last.sequence += 1;
                last.sequence
            }
            None => {
                self.instruments
                    .insert(instrument.to_string(), StampedTrade { trade, sequence: 1 });
                1
            }
        }
    }
}

fn decode_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
    sequences: &mut SequenceStamper,
) -> Vec<Result<Tick, DataError>> {
    match message {
        Ok(Message::Text(text)) => decode_frame(text.as_bytes(), sequences),
        Ok(Message::Binary(payload)) => decode_frame(&payload, sequences),
        Ok(Message::Close(frame)) => vec![Err(DataError::TransientNetwork(format!(
            "feed closed by server: {frame:?}"
        )))],
        Ok(_) => Vec::new(),
        Err(error) => vec![Err(DataError::from(error))],
    }
}

/// Decode a tick frame, skipping incomplete entries.
fn decode_frame(payload: &[u8], sequences: &mut SequenceStamper) -> Vec<Result<Tick, DataError>> {
    let frame = match serde_json::from_slice::<FeedFrame>(payload) {
        Ok(frame) => frame,
        Err(error) => return vec![Err(DataError::from(error))],
    };

    frame
        .feeds
        .into_iter()
        .filter_map(|(key, entry)| {
            let tick = entry.into_tick(&key, sequences);
            if tick.is_none() {
                debug!(instrument = %key, "skipping incomplete feed entry");
            }
            tick
        })
        .map(Ok)
        .collect()
}

/// Deserialize an optional value published either as a JSON string or a JSON number.
fn de_opt_str_or_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Number(serde_json::Number),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Str(raw)) if raw.trim().is_empty() => Ok(None),
        Some(Raw::Str(raw)) => raw.trim().parse().map(Some).map_err(de::Error::custom),
        Some(Raw::Number(number)) => number
            .to_string()
            .parse()
            .map(Some)
            .map_err(de::Error::custom),
    }
}
