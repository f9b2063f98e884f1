//! WebSocket connection to the chat server.
//!
//! One frame may carry several CRLF-terminated lines. Keepalive `PING`s are
//! answered here; everything else is forwarded to the classifier.

use beach_harbor_core::{OutboundCommand, PipelineError};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::Readiness;

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership";
const DEFAULT_PING_PAYLOAD: &str = ":tmi.twitch.tv";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub login: String,
    pub oauth_token: String,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("upstream send failed: {0}")]
    Send(#[source] tungstenite::Error),
    #[error("upstream receive failed: {0}")]
    Receive(#[source] tungstenite::Error),
    #[error("upstream closed the connection")]
    Closed,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Lines that authenticate and request tags, commands and membership events.
pub fn handshake(config: &UpstreamConfig) -> [String; 3] {
    let token = config
        .oauth_token
        .strip_prefix("oauth:")
        .unwrap_or(&config.oauth_token);
    [
        format!("PASS oauth:{token}\r\n"),
        format!("NICK {}\r\n", config.login),
        format!("{CAPABILITIES}\r\n"),
    ]
}

pub fn split_lines(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
}

/// The reply for a keepalive line, if `line` is one.
pub fn pong_for(line: &str) -> Option<String> {
    let rest = line.strip_prefix("PING")?;
    if !(rest.is_empty() || rest.starts_with(' ')) {
        return None;
    }
    let payload = rest.trim();
    let payload = if payload.is_empty() {
        DEFAULT_PING_PAYLOAD
    } else {
        payload
    };
    Some(format!("PONG {payload}\r\n"))
}

/// Runs one upstream session until cancellation or connection loss.
pub async fn run_upstream(
    config: UpstreamConfig,
    lines: mpsc::Sender<String>,
    mut commands: mpsc::Receiver<OutboundCommand>,
    readiness: Readiness,
    cancel: CancellationToken,
) -> Result<(), UpstreamError> {
    let (stream, _) = connect_async(config.url.as_str())
        .await
        .map_err(|source| UpstreamError::Connect {
            url: config.url.clone(),
            source,
        })?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    for line in handshake(&config) {
        ws_tx
            .send(Message::Text(line))
            .await
            .map_err(UpstreamError::Send)?;
    }
    readiness.set_ready();
    info!(url = %config.url, login = %config.login, "upstream connected");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break Ok(());
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("outbound command queue closed");
                    break Ok(());
                };
                if let Err(err) = ws_tx.send(Message::Text(command.to_wire())).await {
                    break Err(UpstreamError::Send(err));
                }
                debug!(%command, "sent upstream command");
            }
            frame = ws_rx.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        info!(reason = ?frame.map(|f| f.reason.to_string()), "upstream closed websocket");
                        break Err(UpstreamError::Closed);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break Err(UpstreamError::Receive(err)),
                    None => break Err(UpstreamError::Closed),
                };
                for line in split_lines(&payload) {
                    if let Some(pong) = pong_for(line) {
                        counter!("beach_harbor_keepalives_total", 1);
                        if let Err(err) = ws_tx.send(Message::Text(pong)).await {
                            warn!(error = %err, "failed to answer keepalive");
                        }
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = lines.send(line.to_string()) => {
                            if sent.is_err() {
                                readiness.set_not_ready();
                                return Err(PipelineError::LineSinkClosed.into());
                            }
                        }
                    }
                }
            }
        }
    };

    readiness.set_not_ready();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_normalizes_token_prefix() {
        let config = UpstreamConfig {
            url: "wss://example.invalid".into(),
            login: "alice".into(),
            oauth_token: "oauth:secret".into(),
        };
        assert_eq!(
            handshake(&config),
            [
                "PASS oauth:secret\r\n".to_string(),
                "NICK alice\r\n".to_string(),
                "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership\r\n".to_string(),
            ]
        );
    }

    #[test]
    fn frames_split_into_lines() {
        let payload = ":a!a@a PRIVMSG #x :one\r\n:b!b@b PRIVMSG #x :two\r\n\r\n";
        let lines: Vec<&str> = split_lines(payload).collect();
        assert_eq!(lines, vec![":a!a@a PRIVMSG #x :one", ":b!b@b PRIVMSG #x :two"]);
    }

    #[test]
    fn keepalive_replies() {
        assert_eq!(
            pong_for("PING :tmi.twitch.tv").as_deref(),
            Some("PONG :tmi.twitch.tv\r\n")
        );
        assert_eq!(pong_for("PING").as_deref(), Some("PONG :tmi.twitch.tv\r\n"));
        assert_eq!(pong_for("PINGER :x"), None);
        assert_eq!(pong_for(":a!a@a PRIVMSG #x :PING"), None);
    }
}
