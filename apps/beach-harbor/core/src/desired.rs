//! Desired room set: the rooms the account should be in.
//!
//! [`DesiredStore`] is the only writer. It owns the durable file, applies
//! intents from a bounded queue and publishes immutable [`DesiredSnapshot`]s
//! through a [`DesiredHandle`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::MembershipOp;
use crate::persist::{self, DesiredFile, StoreError, SCHEMA_VERSION};
use crate::room::RoomName;

pub const INITIAL_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub account: String,
    pub write_debounce: Duration,
    pub intent_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("channels.json"),
            account: String::new(),
            write_debounce: Duration::from_millis(150),
            intent_capacity: 256,
        }
    }
}

/// A requested change to the desired set. The channel is normalized when the
/// store applies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "Op")]
    pub op: MembershipOp,
    #[serde(rename = "Channel")]
    pub channel: String,
}

impl Intent {
    pub fn join(channel: impl Into<String>) -> Self {
        Self {
            op: MembershipOp::Join,
            channel: channel.into(),
        }
    }

    pub fn part(channel: impl Into<String>) -> Self {
        Self {
            op: MembershipOp::Part,
            channel: channel.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DesiredSnapshot {
    pub version: u64,
    pub account: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Sorted and deduplicated.
    pub channels: Vec<RoomName>,
}

impl DesiredSnapshot {
    pub fn contains(&self, room: &RoomName) -> bool {
        self.channels.binary_search(room).is_ok()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Debug)]
struct Shared {
    current: RwLock<Arc<DesiredSnapshot>>,
    updates: Notify,
}

/// Read side of the store.
#[derive(Debug, Clone)]
pub struct DesiredHandle {
    shared: Arc<Shared>,
}

impl DesiredHandle {
    /// Latest committed snapshot.
    pub fn snapshot(&self) -> Arc<DesiredSnapshot> {
        self.shared.current.read().clone()
    }

    /// Resolves once a snapshot newer than the last wake-up has been
    /// committed. Commits made while nobody is waiting collapse into a single
    /// pending wake-up. Intended for one waiter.
    pub async fn changed(&self) {
        self.shared.updates.notified().await;
    }

    pub(crate) fn from_snapshot(snapshot: DesiredSnapshot) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(Arc::new(snapshot)),
                updates: Notify::new(),
            }),
        }
    }

    pub(crate) fn publish(&self, snapshot: DesiredSnapshot) {
        *self.shared.current.write() = Arc::new(snapshot);
        self.shared.updates.notify_one();
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("intent queue is full")]
    Full,
    #[error("desired-state store has stopped")]
    Closed,
}

/// Write side handed to control surfaces. Never waits for queue space.
#[derive(Debug, Clone)]
pub struct IntentSubmitter {
    tx: mpsc::Sender<Intent>,
}

impl IntentSubmitter {
    pub fn submit(&self, intent: Intent) -> Result<(), SubmitError> {
        self.tx.try_send(intent).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

#[derive(Debug)]
pub struct DesiredStore {
    config: StoreConfig,
    handle: DesiredHandle,
    intents: mpsc::Receiver<Intent>,
    desired: BTreeSet<RoomName>,
    version: u64,
}

impl DesiredStore {
    /// Loads (or creates) the durable file and publishes the initial
    /// snapshot at version [`INITIAL_VERSION`].
    pub fn open(config: StoreConfig) -> Result<(Self, IntentSubmitter), StoreError> {
        if config.path.as_os_str().is_empty() {
            return Err(StoreError::EmptyPath);
        }
        let account = config.account.trim().to_string();
        if account.is_empty() {
            return Err(StoreError::EmptyAccount);
        }

        let (desired, updated_at) = match persist::load(&config.path)? {
            Some(file) => {
                if file.account != account {
                    return Err(StoreError::AccountMismatch {
                        path: config.path.clone(),
                        found: file.account,
                        expected: account,
                    });
                }
                let mut desired = BTreeSet::new();
                for raw in &file.channels {
                    match RoomName::parse(raw) {
                        Some(room) => {
                            desired.insert(room);
                        }
                        None => warn!(entry = %raw, path = %config.path.display(), "dropping invalid room entry"),
                    }
                }
                info!(
                    path = %config.path.display(),
                    rooms = desired.len(),
                    "loaded desired room set"
                );
                (desired, file.updated_at)
            }
            None => {
                let now = OffsetDateTime::now_utc();
                persist::write_atomic(
                    &config.path,
                    &DesiredFile {
                        schema: SCHEMA_VERSION,
                        account: account.clone(),
                        updated_at: now,
                        channels: Vec::new(),
                    },
                )?;
                info!(path = %config.path.display(), "initialized empty desired room set");
                (BTreeSet::new(), now)
            }
        };

        let snapshot = DesiredSnapshot {
            version: INITIAL_VERSION,
            account: account.clone(),
            updated_at,
            channels: desired.iter().cloned().collect(),
        };
        record_gauges(&snapshot);
        let handle = DesiredHandle::from_snapshot(snapshot);

        let (tx, intents) = mpsc::channel(config.intent_capacity.max(1));
        let store = Self {
            config: StoreConfig { account, ..config },
            handle,
            intents,
            desired,
            version: INITIAL_VERSION,
        };
        Ok((store, IntentSubmitter { tx }))
    }

    pub fn handle(&self) -> DesiredHandle {
        self.handle.clone()
    }

    /// Applies intents until the queue closes or `cancel` fires, writing the
    /// set once per debounce window. A failed write ends the loop.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StoreError> {
        let debounce = self.config.write_debounce;
        let timer = tokio::time::sleep(debounce);
        tokio::pin!(timer);
        let mut dirty = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                intent = self.intents.recv() => {
                    let Some(intent) = intent else {
                        debug!("intent queue closed");
                        break;
                    };
                    if self.apply(intent) && !dirty {
                        dirty = true;
                        timer.as_mut().reset(Instant::now() + debounce);
                    }
                }
                () = &mut timer, if dirty => {
                    self.commit().await?;
                    dirty = false;
                }
            }
        }

        if dirty {
            self.commit().await?;
        }
        info!(version = self.version, "desired-state store stopped");
        Ok(())
    }

    /// Returns whether the set changed.
    fn apply(&mut self, intent: Intent) -> bool {
        let Some(room) = RoomName::parse(&intent.channel) else {
            counter!("beach_harbor_intents_total", 1, "op" => intent.op.metric_label(), "outcome" => "invalid");
            warn!(op = %intent.op, channel = %intent.channel, "ignoring intent with invalid room");
            return false;
        };
        let changed = match intent.op {
            MembershipOp::Join => self.desired.insert(room.clone()),
            MembershipOp::Part => self.desired.remove(&room),
        };
        let outcome = if changed { "applied" } else { "noop" };
        counter!("beach_harbor_intents_total", 1, "op" => intent.op.metric_label(), "outcome" => outcome);
        debug!(op = %intent.op, %room, changed, "intent");
        changed
    }

    /// Writes on the blocking pool; the snapshot is published only after the
    /// file is durable.
    async fn commit(&mut self) -> Result<(), StoreError> {
        let updated_at = OffsetDateTime::now_utc();
        let channels: Vec<RoomName> = self.desired.iter().cloned().collect();
        let file = DesiredFile {
            schema: SCHEMA_VERSION,
            account: self.config.account.clone(),
            updated_at,
            channels: channels.iter().map(|room| room.to_string()).collect(),
        };
        let path = self.config.path.clone();
        let written = tokio::task::spawn_blocking(move || persist::write_atomic(&path, &file))
            .await
            .map_err(StoreError::WriterTask)
            .and_then(|result| result);
        if let Err(err) = written {
            counter!("beach_harbor_desired_writes_total", 1, "outcome" => err.metric_label());
            return Err(err);
        }
        counter!("beach_harbor_desired_writes_total", 1, "outcome" => "ok");

        self.version += 1;
        let snapshot = DesiredSnapshot {
            version: self.version,
            account: self.config.account.clone(),
            updated_at,
            channels,
        };
        record_gauges(&snapshot);
        info!(version = snapshot.version, rooms = snapshot.len(), "committed desired room set");
        self.handle.publish(snapshot);
        Ok(())
    }
}

fn record_gauges(snapshot: &DesiredSnapshot) {
    gauge!("beach_harbor_desired_rooms", snapshot.len() as f64);
    gauge!("beach_harbor_desired_version", snapshot.version as f64);
}
