//! [`ChainClient`] over a CometBFT JSON-RPC endpoint (HTTP GET).
//!
//! Only the routes the sync needs are used: `/status`, `/block` and
//! `/tx_search`. The live feed polls the head and pushes each new block's
//! transactions into a channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use stakeidx_operations::config::NetworkConfig;
use tokio::sync::mpsc;

use crate::client::{BlockInfo, ChainClient, RawEvent, RawTransaction, TxOrigin};
use crate::error::{ClientError, ClientResult};

const TX_SEARCH_PAGE_SIZE: usize = 100;
const LIVE_CHANNEL_CAPACITY: usize = 1_024;

/// Markers CometBFT nodes put in errors for heights below their retain height.
const PRUNED_MARKERS: &[&str] = &["lowest height", "pruned", "is not available"];

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl RpcError {
    fn text(&self) -> String {
        match &self.data {
            Some(serde_json::Value::String(data)) => format!("{} ({})", self.message, data),
            Some(other) => format!("{} ({})", self.message, other),
            None => self.message.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

#[derive(Debug, Deserialize)]
struct BlockResult {
    block: Block,
}

#[derive(Debug, Deserialize)]
struct Block {
    header: Header,
}

#[derive(Debug, Deserialize)]
struct Header {
    height: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct TxSearchResult {
    #[serde(default)]
    txs: Vec<RpcTx>,
    total_count: String,
}

#[derive(Debug, Deserialize)]
struct RpcTx {
    hash: String,
    height: String,
    tx_result: TxResult,
}

#[derive(Debug, Default, Deserialize)]
struct TxResult {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    events: Vec<RpcEvent>,
}

#[derive(Debug, Deserialize)]
struct RpcEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Vec<RpcAttribute>,
}

#[derive(Debug, Deserialize)]
struct RpcAttribute {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Clone)]
pub struct CometRpcClient {
    http: Client,
    base_url: String,
    poll_interval: Duration,
}

impl CometRpcClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    pub fn from_config(network: &NetworkConfig) -> ClientResult<Self> {
        Self::new(
            network.rpc_url.clone(),
            Duration::from_secs(network.request_timeout_secs),
            Duration::from_millis(network.poll_interval_ms),
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        route: &str,
        query: &[(&str, String)],
        height: Option<u64>,
    ) -> ClientResult<T> {
        let url = format!("{}/{}", self.base_url, route);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        decode_response(route, status, &body, height)
    }

    async fn search_page(&self, height: u64, page: usize) -> ClientResult<TxSearchResult> {
        self.call(
            "tx_search",
            &[
                ("query", format!("\"tx.height={height}\"")),
                ("page", page.to_string()),
                ("per_page", TX_SEARCH_PAGE_SIZE.to_string()),
                ("order_by", "\"asc\"".to_string()),
            ],
            Some(height),
        )
        .await
    }

    /// Poll the head and push every transaction above `from`.
    async fn poll(self, mut next: u64, tx: mpsc::Sender<RawTransaction>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => return,
            }

            let head = match self.current_height().await {
                Ok(head) => head,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(url = %self.base_url, error = %e, "Head poll failed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(url = %self.base_url, error = %e, "Live poller stopping");
                    return;
                }
            };

            while next <= head {
                let fetched = match self.block(next).await {
                    Ok(block) => self.block_transactions(next).await.map(|txs| (block, txs)),
                    Err(e) => Err(e),
                };
                let (block, txs) = match fetched {
                    Ok(fetched) => fetched,
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(url = %self.base_url, height = next, error = %e, "Live fetch failed; retrying next tick");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(url = %self.base_url, height = next, error = %e, "Live poller stopping");
                        return;
                    }
                };
                for mut raw in txs {
                    raw.origin = TxOrigin::Live;
                    raw.timestamp = Some(block.timestamp);
                    if tx.send(raw).await.is_err() {
                        return;
                    }
                }
                next += 1;
            }
        }
    }
}

#[async_trait]
impl ChainClient for CometRpcClient {
    async fn current_height(&self) -> ClientResult<u64> {
        let status: StatusResult = self.call("status", &[], None).await?;
        parse_height(&status.sync_info.latest_block_height)
    }

    async fn block(&self, height: u64) -> ClientResult<BlockInfo> {
        let result: BlockResult = self
            .call("block", &[("height", height.to_string())], Some(height))
            .await?;
        Ok(BlockInfo {
            height: parse_height(&result.block.header.height)?,
            timestamp: parse_block_time(&result.block.header.time)?,
        })
    }

    async fn block_transactions(&self, height: u64) -> ClientResult<Vec<RawTransaction>> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let result = self.search_page(height, page).await?;
            let total = parse_height(&result.total_count)?;
            let received = result.txs.len();
            for tx in result.txs {
                if let Some(raw) = convert_tx(tx)? {
                    out.push(raw);
                }
            }
            let seen = (page - 1) * TX_SEARCH_PAGE_SIZE + received;
            if received == 0 || seen as u64 >= total {
                return Ok(out);
            }
            page += 1;
        }
    }

    async fn subscribe(&self) -> ClientResult<mpsc::Receiver<RawTransaction>> {
        let head = self.current_height().await?;
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        tokio::spawn(self.clone().poll(head + 1, tx));
        Ok(rx)
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ClientError::Transient(e.to_string())
    } else if e.status().is_some_and(|s| s.is_server_error()) {
        ClientError::Transient(e.to_string())
    } else {
        ClientError::Fatal(e.to_string())
    }
}

fn decode_response<T: DeserializeOwned>(
    route: &str,
    status: StatusCode,
    body: &str,
    height: Option<u64>,
) -> ClientResult<T> {
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            return Err(ClientError::Transient(format!("{route}: HTTP {status}: {e}")))
        }
        Err(e) => return Err(ClientError::Fatal(format!("{route}: invalid response: {e}"))),
    };

    if let Some(error) = envelope.error {
        return Err(classify_rpc_error(route, status, &error, height));
    }
    envelope
        .result
        .ok_or_else(|| ClientError::Fatal(format!("{route}: response carries no result")))
}

fn classify_rpc_error(
    route: &str,
    status: StatusCode,
    error: &RpcError,
    height: Option<u64>,
) -> ClientError {
    let text = error.text();
    let lowered = text.to_ascii_lowercase();
    if let Some(height) = height {
        if PRUNED_MARKERS.iter().any(|m| lowered.contains(m)) {
            return ClientError::Pruned { height };
        }
    }
    let message = format!("{route}: rpc error {}: {text}", error.code);
    if status.is_server_error() || lowered.contains("timed out") {
        ClientError::Transient(message)
    } else {
        ClientError::Fatal(message)
    }
}

fn parse_height(raw: &str) -> ClientResult<u64> {
    raw.parse()
        .map_err(|_| ClientError::Fatal(format!("invalid height '{raw}'")))
}

/// RFC 3339 block time to Unix seconds.
fn parse_block_time(raw: &str) -> ClientResult<u64> {
    let time = chrono::DateTime::parse_from_rfc3339(raw)
        .map_err(|e| ClientError::Fatal(format!("invalid block time '{raw}': {e}")))?;
    u64::try_from(time.timestamp())
        .map_err(|_| ClientError::Fatal(format!("block time before epoch '{raw}'")))
}

/// Failed transactions carry no state change and are dropped here.
fn convert_tx(tx: RpcTx) -> ClientResult<Option<RawTransaction>> {
    if tx.tx_result.code != 0 {
        return Ok(None);
    }
    Ok(Some(RawTransaction {
        hash: tx.hash,
        height: parse_height(&tx.height)?,
        timestamp: None,
        events: tx
            .tx_result
            .events
            .into_iter()
            .map(|event| RawEvent {
                kind: event.kind,
                attributes: event
                    .attributes
                    .into_iter()
                    .map(|a| (a.key, a.value.unwrap_or_default()))
                    .collect(),
            })
            .collect(),
        origin: TxOrigin::Backfill,
    }))
}
