use candle_data::{
    candle::Candle,
    config::Config,
    error::DataError,
    feed::websocket::WebSocketFeedConnector,
    historical::UpstoxHistoricalFetcher,
    instrument::{InstrumentCache, Symbol},
    service::CandleService,
    session::{Clock, SystemClock},
    store::InMemoryCandleStore,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_WS_ADDR: &str = "0.0.0.0:9001";
const DEFAULT_FEED_AUTHORIZE_URL: &str =
    "https://api.upstox.com/v2/feed/market-data-feed/authorize";
const INSTRUMENT_SEGMENT: &str = "NSE_EQ";
const INSTRUMENT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Message sent by a chart or scanner client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// Scanner alert, subscribes the symbol.
    Alert { symbol: String },
    /// Stream candles of the symbol as they are persisted.
    Watch { symbol: String },
    /// Every stored candle of the symbol for a trading date.
    History { symbol: String, date: NaiveDate },
}

/// Message sent to a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Welcome {
        message: String,
        timestamp: DateTime<Utc>,
    },
    LiveCandle {
        candle: Candle,
    },
    History {
        symbol: Symbol,
        date: NaiveDate,
        candles: Vec<Candle>,
    },
    Error {
        message: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "candle-data-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DataError> {
    info!("Starting candle-data WebSocket server");

    let config = load_config()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let session = config.session()?;

    let access_token = required_env("UPSTOX_ACCESS_TOKEN")?;

    // Instrument reference data, reloaded daily
    let instruments_path = PathBuf::from(required_env("CANDLE_INSTRUMENTS_PATH")?);
    let instruments = Arc::new(InstrumentCache::new(
        Some(INSTRUMENT_SEGMENT),
        Arc::clone(&clock),
    ));
    load_instruments(&instruments, &instruments_path).await?;
    tokio::spawn(refresh_instruments(Arc::clone(&instruments), instruments_path));

    let connector = match std::env::var("CANDLE_FEED_URL") {
        Ok(url) => WebSocketFeedConnector::direct(parse_url("CANDLE_FEED_URL", &url)?),
        Err(_) => WebSocketFeedConnector::authorized(
            parse_url("CANDLE_FEED_AUTHORIZE_URL", DEFAULT_FEED_AUTHORIZE_URL)?,
            access_token.clone(),
        ),
    };

    let mut fetcher = UpstoxHistoricalFetcher::new(access_token, session, Arc::clone(&clock))?;
    if let Ok(base_url) = std::env::var("CANDLE_HISTORICAL_BASE_URL") {
        fetcher = fetcher.with_base_url(parse_url("CANDLE_HISTORICAL_BASE_URL", &base_url)?);
    }

    let service = Arc::new(CandleService::start(
        config,
        instruments,
        Arc::new(connector),
        Arc::new(fetcher),
        Arc::new(InMemoryCandleStore::new()),
        clock,
    )?);

    // Configurable via WS_ADDR env var (default: 0.0.0.0:9001)
    let server_addr = std::env::var("WS_ADDR").unwrap_or_else(|_| DEFAULT_WS_ADDR.to_string());
    let server_addr = server_addr
        .parse::<SocketAddr>()
        .map_err(|error| DataError::Config(format!("WS_ADDR='{server_addr}': {error}")))?;
    let listener = TcpListener::bind(&server_addr)
        .await
        .map_err(|error| DataError::Config(format!("failed to bind {server_addr}: {error}")))?;
    info!("WebSocket server listening on ws://{}", server_addr);

    let server = tokio::spawn(start_websocket_server(listener, Arc::clone(&service)));

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    server.abort();
    service.shutdown().await;
    Ok(())
}

fn init_logging() {
    let subscriber = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );

    // CANDLE_LOG_JSON switches to one JSON object per line
    if std::env::var_os("CANDLE_LOG_JSON").is_some() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// [`Config`] from the optional `CANDLE_CONFIG` JSON file, overlaid with `CANDLE_*` variables.
fn load_config() -> Result<Config, DataError> {
    let config = match std::env::var("CANDLE_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|error| DataError::Config(format!("CANDLE_CONFIG='{path}': {error}")))?;
            Config::from_json_str(&json)?
        }
        Err(_) => Config::default(),
    };

    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn required_env(name: &str) -> Result<String, DataError> {
    std::env::var(name).map_err(|_| DataError::Config(format!("{name} must be set")))
}

fn parse_url(name: &str, url: &str) -> Result<Url, DataError> {
    Url::parse(url).map_err(|error| DataError::Config(format!("{name}='{url}': {error}")))
}

async fn load_instruments(cache: &InstrumentCache, path: &Path) -> Result<usize, DataError> {
    let json = tokio::fs::read_to_string(path).await.map_err(|error| {
        DataError::Config(format!("failed to read {}: {error}", path.display()))
    })?;
    cache.refresh_from_json(&json)
}

async fn refresh_instruments(cache: Arc<InstrumentCache>, path: PathBuf) {
    let mut interval = tokio::time::interval(INSTRUMENT_REFRESH_INTERVAL);
    // First tick completes immediately, the initial load already happened
    interval.tick().await;

    loop {
        interval.tick().await;
        if let Err(error) = load_instruments(&cache, &path).await {
            warn!(%error, "instrument refresh failed, lookups fail once the cache is stale");
        }
    }
}

/// Accept client connections until the listener fails.
async fn start_websocket_server(listener: TcpListener, service: Arc<CandleService>) {
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("New WebSocket connection from {}", peer_addr);
        tokio::spawn(handle_client(stream, peer_addr, Arc::clone(&service)));
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, service: Arc<CandleService>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let _ = tx.send(ServerMessage::Welcome {
        message: "Connected to candle-data feed".to_string(),
        timestamp: Utc::now(),
    });

    // Spawn task to send server messages to this client
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(error) => {
                    warn!(%error, "failed to serialise server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming client requests
    let mut recv_task = tokio::spawn(async move {
        let mut watches = Vec::<JoinHandle<()>>::new();

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(request) => handle_request(&service, request, &tx, &mut watches).await,
                        Err(error) => Some(ServerMessage::Error {
                            message: format!("invalid request: {error}"),
                        }),
                    };
                    if let Some(reply) = reply {
                        let _ = tx.send(reply);
                    }
                }
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }

        for watch in watches {
            watch.abort();
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

async fn handle_request(
    service: &CandleService,
    request: ClientMessage,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    watches: &mut Vec<JoinHandle<()>>,
) -> Option<ServerMessage> {
    let error = |error: DataError| ServerMessage::Error {
        message: error.to_string(),
    };

    match request {
        ClientMessage::Alert { symbol } => match service.handle_scanner_alert(&symbol) {
            Ok(symbol) => {
                info!(%symbol, "scanner alert received");
                None
            }
            Err(e) => Some(error(e)),
        },
        ClientMessage::Watch { symbol } => {
            let symbol = match Symbol::parse(&symbol) {
                Ok(symbol) => symbol,
                Err(e) => return Some(error(e)),
            };

            let mut updates = service.stream_live_updates(symbol);
            let tx = tx.clone();
            watches.push(tokio::spawn(async move {
                while let Some(candle) = updates.next().await {
                    if tx.send(ServerMessage::LiveCandle { candle }).is_err() {
                        break;
                    }
                }
            }));
            None
        }
        ClientMessage::History { symbol, date } => {
            let symbol = match Symbol::parse(&symbol) {
                Ok(symbol) => symbol,
                Err(e) => return Some(error(e)),
            };

            match service.get_candles(&symbol, date).await {
                Ok(candles) => Some(ServerMessage::History {
                    symbol,
                    date,
                    candles,
                }),
                Err(e) => Some(error(e)),
            }
        }
    }
}
