//! parley: manual test client for parley-server.
//!
//! Connects as `--sender-id`, prints every envelope it receives and sends
//! `--message` to `--receiver-id` once per interval until Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use parley_core::protocol::{CLOSE_GRACE, UID_PARAM, WS_PATH};
use parley_core::Envelope;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use url::Url;

/// parley: relay test client
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Send and receive envelopes through a parley server")]
struct Cli {
    /// Server address (host:port)
    #[arg(long, default_value = "localhost:8000")]
    addr: String,

    /// Id to register as
    #[arg(long)]
    sender_id: String,

    /// Id to send messages to
    #[arg(long)]
    receiver_id: String,

    /// Message body
    #[arg(long, default_value = "Hello there")]
    message: String,

    /// Delay between sends, in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// `ws://<addr>/ws?uid=<sender_id>`, with the id percent-encoded.
fn build_url(addr: &str, sender_id: &str) -> Result<Url> {
    if sender_id.is_empty() {
        bail!("sender id must not be empty");
    }
    let mut url = Url::parse(&format!("ws://{addr}{WS_PATH}"))
        .with_context(|| format!("invalid server address: {addr}"))?;
    url.query_pairs_mut().append_pair(UID_PARAM, sender_id);
    Ok(url)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let url = build_url(&cli.addr, &cli.sender_id)?;
    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(url = %url, "connected");

    let (mut sink, mut stream) = ws.split();
    let outgoing = Envelope::new(&cli.sender_id, &cli.receiver_id, &cli.message).encode()?;
    let mut ticker = tokio::time::interval(Duration::from_millis(cli.interval_ms.max(1)));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, closing");
                break;
            }
            _ = ticker.tick() => {
                sink.send(Message::Binary(outgoing.clone()))
                    .await
                    .context("send failed")?;
                info!(receiver = %cli.receiver_id, "sent");
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => print_envelope(&data),
                Some(Ok(Message::Text(text))) => print_envelope(text.as_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "server closed the connection");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("connection error"),
                None => {
                    info!("connection ended");
                    return Ok(());
                }
            },
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(close))).await {
        warn!(error = %e, "failed to send close frame");
        return Ok(());
    }

    // Wait for the server's half of the closing handshake.
    let acknowledged = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if acknowledged.is_err() {
        warn!("server did not acknowledge close in time");
    }
    Ok(())
}

fn print_envelope(data: &[u8]) {
    match Envelope::decode(data) {
        Ok(envelope) => info!(
            sender = %envelope.sender_id,
            channel = envelope.channel_id.as_deref().unwrap_or("-"),
            message = %envelope.message,
            "received"
        ),
        Err(e) => warn!(error = %e, "undecodable frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_uid() {
        let url = build_url("localhost:8000", "alice").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws?uid=alice");
    }

    #[test]
    fn uid_is_encoded() {
        let url = build_url("127.0.0.1:9001", "bob smith&co").unwrap();
        assert_eq!(url.path(), "/ws");
        let uid = url
            .query_pairs()
            .find(|(key, _)| key == UID_PARAM)
            .map(|(_, value)| value.into_owned());
        assert_eq!(uid.as_deref(), Some("bob smith&co"));
    }

    #[test]
    fn empty_sender_rejected() {
        assert!(build_url("localhost:8000", "").is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["parley", "--sender-id", "a", "--receiver-id", "b"]);
        assert_eq!(cli.addr, "localhost:8000");
        assert_eq!(cli.message, "Hello there");
        assert_eq!(cli.interval_ms, 1000);
    }
}
