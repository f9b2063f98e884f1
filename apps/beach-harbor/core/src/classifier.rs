use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::event::{ChatMessage, MembershipChange, MembershipOp, TypedEvent};
use crate::line::{ParseError, ParsedLine};
use crate::room::{RoomName, ROOM_SIGIL};

const CHAT_COMMAND: &str = "PRIVMSG";
const TAG_USER_ID: &str = "user-id";
const TAG_ROOM_ID: &str = "room-id";

/// Why a line produced nothing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("chat message without room or text")]
    MalformedChatMessage,
    #[error("{0} without a room")]
    MissingRoom(MembershipOp),
}

impl SkipReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SkipReason::Parse(err) => err.metric_label(),
            SkipReason::MalformedChatMessage => "malformed_chat_message",
            SkipReason::MissingRoom(_) => "missing_room",
        }
    }
}

/// Output of one classified line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub event: Option<TypedEvent>,
    pub signal: Option<MembershipChange>,
}

/// Turns raw upstream lines into exported events and membership signals for
/// the local account.
#[derive(Debug, Clone)]
pub struct Classifier {
    own_login: String,
}

impl Classifier {
    pub fn new(own_login: &str) -> Self {
        Self {
            own_login: own_login.trim().to_ascii_lowercase(),
        }
    }

    pub fn own_login(&self) -> &str {
        &self.own_login
    }

    pub fn classify(&self, line: &str) -> Result<Classified, SkipReason> {
        let parsed = ParsedLine::parse(line)?;

        if parsed.command == CHAT_COMMAND {
            return chat_message(&parsed).map(|msg| Classified {
                event: Some(msg.into()),
                signal: None,
            });
        }

        let Some(op) = MembershipOp::from_command(parsed.command) else {
            return Ok(Classified::default());
        };
        let raw_room = parsed
            .params
            .first()
            .copied()
            .or(parsed.trailing)
            .ok_or(SkipReason::MissingRoom(op))?;

        // Server-originated lines carry no prefix and cannot be attributed.
        let Some(login) = parsed.prefix_login() else {
            return Ok(Classified::default());
        };
        if !login.eq_ignore_ascii_case(&self.own_login) {
            return Ok(Classified::default());
        }
        let channel = RoomName::parse(raw_room).ok_or(SkipReason::MissingRoom(op))?;
        let change = MembershipChange { op, channel };
        Ok(Classified {
            event: Some(change.clone().into()),
            signal: Some(change),
        })
    }
}

fn chat_message(parsed: &ParsedLine<'_>) -> Result<ChatMessage, SkipReason> {
    let room = parsed
        .params
        .first()
        .copied()
        .ok_or(SkipReason::MalformedChatMessage)?;
    let text = parsed.trailing_text();
    if text.is_empty() {
        return Err(SkipReason::MalformedChatMessage);
    }
    let user_login = parsed.prefix_login().unwrap_or_default();
    let channel_login = room.strip_prefix(ROOM_SIGIL).unwrap_or(room);
    let user_id = parsed.tag_non_empty(TAG_USER_ID).unwrap_or(user_login);
    let channel_id = parsed.tag_non_empty(TAG_ROOM_ID).unwrap_or(channel_login);

    Ok(ChatMessage {
        user_id: user_id.to_string(),
        user_login: user_login.to_string(),
        channel_id: channel_id.to_string(),
        channel_login: channel_login.to_string(),
        text: text.to_string(),
    })
}

/// Consumes the inbound line queue until it closes or `cancel` fires.
///
/// Events wait for space in `events`; membership signals are dropped when
/// `signals` is full since the rectifier re-derives them on its next tick.
pub async fn run_classifier(
    classifier: Classifier,
    mut lines: mpsc::Receiver<String>,
    events: mpsc::Sender<TypedEvent>,
    signals: mpsc::Sender<MembershipChange>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    info!(login = %classifier.own_login(), "classifier started");
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.recv() => match line {
                Some(line) => line,
                None => {
                    info!("inbound line queue closed; classifier exiting");
                    return Ok(());
                }
            },
        };

        let classified = match classifier.classify(&line) {
            Ok(classified) => classified,
            Err(reason) => {
                counter!("beach_harbor_lines_skipped_total", 1, "reason" => reason.metric_label());
                debug!(%reason, line = %line, "skipping line");
                continue;
            }
        };
        counter!("beach_harbor_lines_classified_total", 1);

        if let Some(signal) = classified.signal {
            match signals.try_send(signal) {
                Ok(()) => counter!("beach_harbor_membership_signals_total", 1, "outcome" => "delivered"),
                Err(TrySendError::Full(signal)) => {
                    counter!("beach_harbor_membership_signals_total", 1, "outcome" => "dropped");
                    debug!(room = %signal.channel, op = %signal.op, "membership signal queue full; dropping");
                }
                Err(TrySendError::Closed(_)) => {
                    counter!("beach_harbor_membership_signals_total", 1, "outcome" => "closed");
                }
            }
        }

        if let Some(event) = classified.event {
            let kind = event.kind();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = events.send(event) => {
                    sent.map_err(|_| PipelineError::EventSinkClosed)?;
                    counter!("beach_harbor_events_emitted_total", 1, "kind" => kind);
                }
            }
        }
    }
}
