//! Streaming client for the Lightstreamer push feed (TLCP text protocol over
//! HTTP). Only what the monitor needs is implemented: one session, one MERGE
//! subscription to a single item, and reconnection when the session dies.

use crate::ingest::SignalIngestor;
use crate::monitor::MonitorHandle;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_FEED_SERVER: &str = "https://push.lightstreamer.com";
pub const DEFAULT_ADAPTER_SET: &str = "ISSLIVE";
pub const DEFAULT_ITEM: &str = "NODE3000005";

const TLCP_VERSION: &str = "TLCP-2.2.0";
const CLIENT_ID: &str = "mgQkwtwdysogQz2BJ4Ji kOj2Bg";
const SUBSCRIPTION_ID: u32 = 1;
const SCHEMA: [&str; 2] = ["Value", "TimeStamp"];
const VALUE_FIELD: usize = 0;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub server: Url,
    pub adapter_set: String,
    pub item: String,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid feed url: {0}")]
    Url(#[from] url::ParseError),
    #[error("feed request failed with status {0}")]
    Status(u16),
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stream idle for {0:?}")]
    Idle(Duration),
    #[error("session ended by server ({code}): {message}")]
    Ended { code: String, message: String },
    #[error("server asked for a rebind")]
    Rebind,
    #[error("stream closed")]
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlcpMessage {
    ConOk {
        session_id: String,
        keepalive: Duration,
        control_link: Option<String>,
    },
    SubOk {
        sub_id: u32,
    },
    Update {
        sub_id: u32,
        item: u32,
        values: String,
    },
    Loop,
    End {
        code: String,
        message: String,
    },
    ConErr {
        code: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    ReqOk,
    ReqErr {
        code: String,
        message: String,
    },
    Probe,
    Other(String),
}

pub fn parse_line(line: &str) -> Result<TlcpMessage, FeedError> {
    let (tag, rest) = line.split_once(',').unwrap_or((line, ""));
    let message = match tag {
        "CONOK" => {
            let parts: Vec<&str> = rest.split(',').collect();
            if parts.len() < 3 {
                return Err(FeedError::Protocol(format!("short CONOK: {line}")));
            }
            let keepalive_ms = parts[2]
                .parse::<u64>()
                .map_err(|_| FeedError::Protocol(format!("bad keep-alive: {line}")))?;
            let control_link = parts
                .get(3)
                .map(|link| link.trim())
                .filter(|link| !link.is_empty() && *link != "*")
                .map(str::to_string);
            TlcpMessage::ConOk {
                session_id: parts[0].to_string(),
                keepalive: Duration::from_millis(keepalive_ms),
                control_link,
            }
        }
        "SUBOK" => TlcpMessage::SubOk {
            sub_id: parse_id(rest.split(',').next(), line)?,
        },
        "U" => {
            let mut parts = rest.splitn(3, ',');
            let sub_id = parse_id(parts.next(), line)?;
            let item = parse_id(parts.next(), line)?;
            TlcpMessage::Update {
                sub_id,
                item,
                values: parts.next().unwrap_or("").to_string(),
            }
        }
        "LOOP" => TlcpMessage::Loop,
        "PROBE" | "NOOP" => TlcpMessage::Probe,
        "REQOK" => TlcpMessage::ReqOk,
        "END" | "CONERR" | "ERROR" => {
            let (code, message) = rest.split_once(',').unwrap_or((rest, ""));
            let code = code.to_string();
            let message = percent_decode(message);
            match tag {
                "END" => TlcpMessage::End { code, message },
                "CONERR" => TlcpMessage::ConErr { code, message },
                _ => TlcpMessage::Error { code, message },
            }
        }
        "REQERR" => {
            let mut parts = rest.splitn(3, ',');
            let _req_id = parts.next();
            TlcpMessage::ReqErr {
                code: parts.next().unwrap_or("").to_string(),
                message: percent_decode(parts.next().unwrap_or("")),
            }
        }
        _ => TlcpMessage::Other(line.to_string()),
    };
    Ok(message)
}

fn parse_id(value: Option<&str>, line: &str) -> Result<u32, FeedError> {
    value
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| FeedError::Protocol(format!("bad id in: {line}")))
}

/// Current field values of a MERGE subscription. Updates only carry the
/// fields that changed, so the previous values fill the gaps.
#[derive(Debug)]
pub struct MergeState {
    fields: Vec<Option<String>>,
}

impl MergeState {
    pub fn new(field_count: usize) -> Self {
        Self {
            fields: vec![None; field_count],
        }
    }

    pub fn apply(&mut self, encoded: &str) -> Result<&[Option<String>], FeedError> {
        let mut index = 0usize;
        for token in encoded.split('|') {
            if let Some(count) = token.strip_prefix('^') {
                let count = count
                    .parse::<usize>()
                    .map_err(|_| FeedError::Protocol(format!("bad skip token: {token}")))?;
                index += count;
                continue;
            }
            let slot = self
                .fields
                .get_mut(index)
                .ok_or_else(|| FeedError::Protocol(format!("too many fields: {encoded}")))?;
            match token {
                "" => {}
                "#" => *slot = None,
                "$" => *slot = Some(String::new()),
                value => *slot = Some(percent_decode(value)),
            }
            index += 1;
        }
        if index > self.fields.len() {
            return Err(FeedError::Protocol(format!("too many fields: {encoded}")));
        }
        Ok(&self.fields)
    }
}

fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned()
}

fn encode_params(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Splits a byte stream into protocol lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

fn endpoint(base: &Url, name: &str, session_id: Option<&str>) -> Result<Url, FeedError> {
    let mut url = base.join(&format!("lightstreamer/{name}"))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("LS_protocol", TLCP_VERSION);
        if let Some(session_id) = session_id {
            query.append_pair("LS_session", session_id);
        }
    }
    Ok(url)
}

fn control_base(server: &Url, control_link: Option<&str>) -> Result<Url, FeedError> {
    match control_link {
        Some(link) => Ok(Url::parse(&format!("{}://{}/", server.scheme(), link))?),
        None => Ok(server.clone()),
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}

pub fn spawn_feed(
    config: FeedConfig,
    client: reqwest::Client,
    monitor: MonitorHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(feed_loop(config, client, monitor))
}

/// Keeps a feed session open for as long as the monitor is alive. A lost
/// session only pauses ingestion; detector state is never touched here.
async fn feed_loop(config: FeedConfig, client: reqwest::Client, monitor: MonitorHandle) {
    let mut ingestor = SignalIngestor::new();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match run_session(&config, &client, &mut ingestor, &monitor, &mut backoff).await {
            Ok(()) => {
                info!(event = "feed_stop", reason = "monitor_closed");
                return;
            }
            Err(FeedError::Rebind) => {
                info!(event = "feed_rebind");
            }
            Err(err) => {
                warn!(event = "feed_error", error = %err, retry_in = ?backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

/// Runs one session. Returns `Ok` only when the monitor has gone away.
async fn run_session(
    config: &FeedConfig,
    client: &reqwest::Client,
    ingestor: &mut SignalIngestor,
    monitor: &MonitorHandle,
    backoff: &mut Duration,
) -> Result<(), FeedError> {
    let url = endpoint(&config.server, "create_session.txt", None)?;
    let body = encode_params(&[
        ("LS_cid", CLIENT_ID),
        ("LS_adapter_set", &config.adapter_set),
        ("LS_polling", "false"),
    ]);
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(FeedError::Status(response.status().as_u16()));
    }

    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut merge = MergeState::new(SCHEMA.len());
    let mut idle_timeout = HANDSHAKE_IDLE_TIMEOUT;

    loop {
        let chunk = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => return Err(FeedError::Idle(idle_timeout)),
            Ok(None) => return Err(FeedError::Eof),
            Ok(Some(chunk)) => chunk?,
        };
        for line in lines.push(&chunk) {
            match parse_line(&line)? {
                TlcpMessage::ConOk {
                    session_id,
                    keepalive,
                    control_link,
                } => {
                    *backoff = INITIAL_BACKOFF;
                    idle_timeout = (keepalive * 2).max(MIN_IDLE_TIMEOUT);
                    info!(
                        event = "feed_session_open",
                        session_id = %session_id,
                        keepalive = ?keepalive
                    );
                    let base = control_base(&config.server, control_link.as_deref())?;
                    subscribe(client, &base, &session_id, &config.item).await?;
                }
                TlcpMessage::SubOk { sub_id } => {
                    info!(event = "feed_subscribed", sub_id, item = %config.item);
                }
                TlcpMessage::Update { sub_id, values, .. } if sub_id == SUBSCRIPTION_ID => {
                    let fields = merge.apply(&values)?;
                    let Some(Some(raw)) = fields.get(VALUE_FIELD) else {
                        continue;
                    };
                    if let Some(sample) = ingestor.accept(raw, Utc::now()) {
                        if !monitor.submit_sample(sample).await {
                            return Ok(());
                        }
                    }
                }
                TlcpMessage::Update { sub_id, item, .. } => {
                    debug!(event = "feed_update_ignored", sub_id, item);
                }
                TlcpMessage::Loop => return Err(FeedError::Rebind),
                TlcpMessage::End { code, message } => {
                    return Err(FeedError::Ended { code, message })
                }
                TlcpMessage::ConErr { code, message }
                | TlcpMessage::Error { code, message }
                | TlcpMessage::ReqErr { code, message } => {
                    return Err(FeedError::Server { code, message })
                }
                other => debug!(event = "feed_line", message = ?other),
            }
        }
    }
}

async fn subscribe(
    client: &reqwest::Client,
    base: &Url,
    session_id: &str,
    item: &str,
) -> Result<(), FeedError> {
    let url = endpoint(base, "control.txt", Some(session_id))?;
    let sub_id = SUBSCRIPTION_ID.to_string();
    let schema = SCHEMA.join(" ");
    let body = encode_params(&[
        ("LS_reqId", "1"),
        ("LS_op", "add"),
        ("LS_subId", &sub_id),
        ("LS_mode", "MERGE"),
        ("LS_group", item),
        ("LS_schema", &schema),
        ("LS_snapshot", "true"),
    ]);
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(FeedError::Status(response.status().as_u16()));
    }
    let text = response.text().await?;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_line(line)? {
            TlcpMessage::ReqErr { code, message } | TlcpMessage::Error { code, message } => {
                return Err(FeedError::Server { code, message });
            }
            _ => {}
        }
    }
    Ok(())
}
