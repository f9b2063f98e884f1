//! Reconciliation loop driving actual room membership toward the desired set.
//!
//! Each tracked room runs a small state machine:
//!
//! ```text
//!   Idle --JOIN sent--> Joining --confirmed--> Joined --PART sent--> Parting
//!                          |                                           |
//!                       deadline                                   deadline
//!                          v                                           v
//!                        Error --retry after backoff--> ...          Idle
//! ```
//!
//! Outbound commands share one token bucket. A command the outbound queue
//! cannot accept gives its token back and is retried on a later pass.

use std::collections::BTreeMap;
use std::time::Duration;

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::OutboundCommand;
use crate::desired::DesiredHandle;
use crate::event::{MembershipChange, MembershipOp};
use crate::rate_limit::TokenBucket;
use crate::room::RoomName;

#[derive(Debug, Clone)]
pub struct RectifierConfig {
    pub tokens_per_second: f64,
    pub burst: u32,
    /// How long a JOIN or PART may stay unconfirmed.
    pub join_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub tick: Duration,
    /// Forget rooms that are neither wanted nor joined once they settle.
    pub prune_idle: bool,
}

impl Default for RectifierConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 0.5,
            burst: 2,
            join_timeout: Duration::from_secs(30),
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            tick: Duration::from_secs(1),
            prune_idle: false,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RectifierError {
    #[error("outbound command queue closed")]
    CommandSinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Idle,
    Joining,
    Joined,
    Parting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub want: bool,
    pub have: bool,
    pub phase: RoomPhase,
    pub last_attempt_at: Option<Instant>,
    pub deadline: Option<Instant>,
    /// Delay applied after the next unconfirmed attempt. Unset until the
    /// first command goes out.
    pub backoff: Option<Duration>,
    pub next_retry_at: Option<Instant>,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            want: false,
            have: false,
            phase: RoomPhase::Idle,
            last_attempt_at: None,
            deadline: None,
            backoff: None,
            next_retry_at: None,
        }
    }
}

impl RoomState {
    fn retry_due(&self, now: Instant) -> bool {
        self.next_retry_at.map_or(true, |at| now >= at)
    }

    fn part_eligible(&self, now: Instant) -> bool {
        self.have
            && !self.want
            && match self.phase {
                RoomPhase::Idle | RoomPhase::Joined => true,
                RoomPhase::Error => self.retry_due(now),
                RoomPhase::Joining | RoomPhase::Parting => false,
            }
    }

    fn join_eligible(&self, now: Instant) -> bool {
        !self.have
            && self.want
            && match self.phase {
                RoomPhase::Idle => true,
                RoomPhase::Error => self.retry_due(now),
                RoomPhase::Joining | RoomPhase::Joined | RoomPhase::Parting => false,
            }
    }

    fn is_inert(&self) -> bool {
        !self.want && !self.have && self.phase == RoomPhase::Idle
    }

    /// Drops pending retries for a room nobody wants and we are not in.
    fn settle_if_abandoned(&mut self) {
        if !self.want && !self.have && self.phase == RoomPhase::Error {
            self.phase = RoomPhase::Idle;
            self.deadline = None;
            self.next_retry_at = None;
        }
    }
}

enum SendOutcome {
    Sent,
    NoToken,
    QueueFull,
}

pub struct Rectifier {
    config: RectifierConfig,
    desired: DesiredHandle,
    signals: mpsc::Receiver<MembershipChange>,
    commands: mpsc::Sender<OutboundCommand>,
    rooms: BTreeMap<RoomName, RoomState>,
    bucket: TokenBucket,
    observed_version: u64,
}

impl Rectifier {
    pub fn new(
        config: RectifierConfig,
        desired: DesiredHandle,
        signals: mpsc::Receiver<MembershipChange>,
        commands: mpsc::Sender<OutboundCommand>,
    ) -> Self {
        let bucket = TokenBucket::new(config.tokens_per_second, config.burst, Instant::now());
        Self {
            config,
            desired,
            signals,
            commands,
            rooms: BTreeMap::new(),
            bucket,
            observed_version: 0,
        }
    }

    pub fn room(&self, name: &RoomName) -> Option<&RoomState> {
        self.rooms.get(name)
    }

    pub fn rooms(&self) -> impl Iterator<Item = (&RoomName, &RoomState)> {
        self.rooms.iter()
    }

    pub fn joined_count(&self) -> usize {
        self.rooms().filter(|(_, state)| state.have).count()
    }

    /// Recomputes `want` for every room from the latest snapshot. Returns
    /// whether a new version was observed.
    pub fn observe_desired(&mut self) -> bool {
        let snapshot = self.desired.snapshot();
        if snapshot.version == self.observed_version {
            return false;
        }
        for (room, state) in self.rooms.iter_mut() {
            state.want = snapshot.contains(room);
            state.settle_if_abandoned();
        }
        for room in &snapshot.channels {
            self.rooms.entry(room.clone()).or_default().want = true;
        }
        debug!(
            version = snapshot.version,
            previous = self.observed_version,
            rooms = snapshot.len(),
            "observed desired snapshot"
        );
        self.observed_version = snapshot.version;
        true
    }

    pub fn observe_signal(&mut self, signal: MembershipChange) {
        match signal.op {
            MembershipOp::Join => {
                let backoff_min = self.config.backoff_min;
                let state = self.rooms.entry(signal.channel.clone()).or_default();
                state.have = true;
                if matches!(
                    state.phase,
                    RoomPhase::Idle | RoomPhase::Joining | RoomPhase::Error
                ) {
                    state.phase = RoomPhase::Joined;
                    state.deadline = None;
                    state.next_retry_at = None;
                    state.backoff = Some(backoff_min);
                }
                info!(room = %signal.channel, "membership confirmed");
            }
            // Parting completes on its deadline; the echo is informational.
            MembershipOp::Part => {
                debug!(room = %signal.channel, "part echo observed");
            }
        }
    }

    /// One reconciliation pass: expire overdue operations, then issue PART
    /// and JOIN commands while tokens and queue space last.
    pub fn reconcile(&mut self, now: Instant) -> Result<(), RectifierError> {
        self.expire(now);

        let mut blocked = false;
        for (name, state) in self.rooms.iter_mut() {
            if blocked {
                break;
            }
            if !state.part_eligible(now) {
                continue;
            }
            let command = OutboundCommand::part(name.clone());
            match try_send(&mut self.bucket, &self.commands, now, command)? {
                SendOutcome::Sent => begin_attempt(state, RoomPhase::Parting, now, &self.config),
                SendOutcome::NoToken | SendOutcome::QueueFull => blocked = true,
            }
        }

        for (name, state) in self.rooms.iter_mut() {
            if blocked {
                break;
            }
            if !state.join_eligible(now) {
                continue;
            }
            let command = OutboundCommand::join(name.clone());
            match try_send(&mut self.bucket, &self.commands, now, command)? {
                SendOutcome::Sent => begin_attempt(state, RoomPhase::Joining, now, &self.config),
                SendOutcome::NoToken | SendOutcome::QueueFull => blocked = true,
            }
        }

        if self.config.prune_idle {
            self.rooms.retain(|_, state| !state.is_inert());
        }
        gauge!("beach_harbor_joined_rooms", self.joined_count() as f64);
        Ok(())
    }

    fn expire(&mut self, now: Instant) {
        let backoff_max = self.config.backoff_max;
        let backoff_min = self.config.backoff_min;
        for (name, state) in self.rooms.iter_mut() {
            let overdue = state.deadline.is_some_and(|deadline| now >= deadline);
            if !overdue {
                continue;
            }
            match state.phase {
                RoomPhase::Joining if !state.want => {
                    state.phase = RoomPhase::Idle;
                    state.deadline = None;
                    state.next_retry_at = None;
                    counter!("beach_harbor_room_timeouts_total", 1, "op" => "join");
                    debug!(room = %name, "unconfirmed join no longer wanted");
                }
                RoomPhase::Joining => {
                    let delay = state.backoff.unwrap_or(backoff_min);
                    state.phase = RoomPhase::Error;
                    state.deadline = None;
                    state.next_retry_at = Some(now + delay);
                    state.backoff = Some(delay.saturating_mul(2).min(backoff_max));
                    counter!("beach_harbor_room_timeouts_total", 1, "op" => "join");
                    warn!(room = %name, retry_in = ?delay, "join unconfirmed before deadline");
                }
                RoomPhase::Parting => {
                    state.phase = RoomPhase::Idle;
                    state.have = false;
                    state.deadline = None;
                    counter!("beach_harbor_room_timeouts_total", 1, "op" => "part");
                    debug!(room = %name, "part assumed complete");
                }
                _ => state.deadline = None,
            }
        }
    }

    /// Drives the loop until `cancel` fires or the signal queue closes.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RectifierError> {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let desired = self.desired.clone();
        info!(
            tokens_per_second = self.config.tokens_per_second,
            burst = self.config.burst,
            "rectifier started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    self.observe_desired();
                }
                () = desired.changed() => {
                    self.observe_desired();
                }
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.observe_signal(signal),
                    None => {
                        info!("membership signal queue closed; rectifier exiting");
                        return Ok(());
                    }
                },
            }
            self.reconcile(Instant::now())?;
        }
    }
}

fn try_send(
    bucket: &mut TokenBucket,
    commands: &mpsc::Sender<OutboundCommand>,
    now: Instant,
    command: OutboundCommand,
) -> Result<SendOutcome, RectifierError> {
    if !bucket.take(now) {
        return Ok(SendOutcome::NoToken);
    }
    let op = command.op;
    match commands.try_send(command) {
        Ok(()) => {
            counter!("beach_harbor_commands_total", 1, "op" => op.metric_label(), "outcome" => "sent");
            Ok(SendOutcome::Sent)
        }
        Err(TrySendError::Full(command)) => {
            bucket.refund(now);
            counter!("beach_harbor_commands_total", 1, "op" => op.metric_label(), "outcome" => "deferred");
            debug!(room = %command.room, %op, "outbound queue full; deferring");
            Ok(SendOutcome::QueueFull)
        }
        Err(TrySendError::Closed(_)) => {
            bucket.refund(now);
            Err(RectifierError::CommandSinkClosed)
        }
    }
}

fn begin_attempt(state: &mut RoomState, phase: RoomPhase, now: Instant, config: &RectifierConfig) {
    state.phase = phase;
    state.last_attempt_at = Some(now);
    state.deadline = Some(now + config.join_timeout);
    state.backoff.get_or_insert(config.backoff_min);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredSnapshot;
    use time::OffsetDateTime;

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).expect("room")
    }

    fn snapshot(version: u64, rooms: &[&str]) -> DesiredSnapshot {
        let mut channels: Vec<RoomName> = rooms.iter().map(|r| room(r)).collect();
        channels.sort();
        DesiredSnapshot {
            version,
            account: "alice".into(),
            updated_at: OffsetDateTime::UNIX_EPOCH,
            channels,
        }
    }

    struct Harness {
        rectifier: Rectifier,
        desired: DesiredHandle,
        signals: mpsc::Sender<MembershipChange>,
        commands: mpsc::Receiver<OutboundCommand>,
    }

    fn harness(config: RectifierConfig, rooms: &[&str], queue: usize) -> Harness {
        let desired = DesiredHandle::from_snapshot(snapshot(1, rooms));
        let (signals, signal_rx) = mpsc::channel(16);
        let (command_tx, commands) = mpsc::channel(queue);
        let rectifier = Rectifier::new(config, desired.clone(), signal_rx, command_tx);
        Harness {
            rectifier,
            desired,
            signals,
            commands,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundCommand>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd.to_string());
        }
        out
    }

    fn generous() -> RectifierConfig {
        RectifierConfig {
            tokens_per_second: 100.0,
            burst: 100,
            ..RectifierConfig::default()
        }
    }

    #[test]
    fn joins_wanted_rooms_once() {
        let mut h = harness(generous(), &["#a", "#b"], 16);
        let now = Instant::now();
        assert!(h.rectifier.observe_desired());
        assert!(!h.rectifier.observe_desired(), "same version");
        h.rectifier.reconcile(now).expect("reconcile");
        assert_eq!(drain(&mut h.commands), vec!["JOIN #a", "JOIN #b"]);

        let state = h.rectifier.room(&room("#a")).expect("tracked");
        assert_eq!(state.phase, RoomPhase::Joining);
        assert_eq!(state.deadline, Some(now + Duration::from_secs(30)));
        assert_eq!(state.backoff, Some(Duration::from_secs(2)));

        h.rectifier.reconcile(now + Duration::from_secs(1)).expect("reconcile");
        assert!(drain(&mut h.commands).is_empty(), "in flight");
    }

    #[test]
    fn unconfirmed_joins_back_off_exponentially_up_to_the_cap() {
        let config = RectifierConfig {
            join_timeout: Duration::from_secs(5),
            ..generous()
        };
        let mut h = harness(config, &["#a"], 16);
        let name = room("#a");
        let mut now = Instant::now();
        h.rectifier.observe_desired();

        let mut delays = Vec::new();
        for _ in 0..8 {
            h.rectifier.reconcile(now).expect("reconcile");
            assert_eq!(drain(&mut h.commands), vec!["JOIN #a"]);
            now += Duration::from_secs(5);
            h.rectifier.reconcile(now).expect("timeout pass");
            let state = h.rectifier.room(&name).expect("tracked");
            assert_eq!(state.phase, RoomPhase::Error);
            let retry_at = state.next_retry_at.expect("retry scheduled");
            delays.push(retry_at - now);

            // Nothing is retried before the backoff elapses.
            h.rectifier
                .reconcile(retry_at - Duration::from_millis(1))
                .expect("early pass");
            assert!(drain(&mut h.commands).is_empty());
            now = retry_at;
        }

        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 60, 60, 60]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn confirmation_resets_backoff() {
        let config = RectifierConfig {
            join_timeout: Duration::from_secs(5),
            ..generous()
        };
        let mut h = harness(config, &["#a"], 16);
        let start = Instant::now();
        h.rectifier.observe_desired();
        h.rectifier.reconcile(start).expect("join");
        h.rectifier
            .reconcile(start + Duration::from_secs(5))
            .expect("timeout");
        assert_eq!(
            h.rectifier.room(&room("#a")).expect("tracked").backoff,
            Some(Duration::from_secs(4))
        );

        h.rectifier.observe_signal(MembershipChange {
            op: MembershipOp::Join,
            channel: room("#a"),
        });
        let state = h.rectifier.room(&room("#a")).expect("tracked");
        assert_eq!(state.phase, RoomPhase::Joined);
        assert!(state.have);
        assert_eq!(state.backoff, Some(Duration::from_secs(2)));
    }

    #[test]
    fn full_queue_refunds_the_token() {
        let config = RectifierConfig {
            tokens_per_second: 0.0,
            burst: 1,
            ..RectifierConfig::default()
        };
        let mut h = harness(config, &["#a"], 1);
        let now = Instant::now();
        h.rectifier
            .commands
            .try_send(OutboundCommand::join(room("#blocker")))
            .expect("fill queue");

        h.rectifier.observe_desired();
        h.rectifier.reconcile(now).expect("reconcile");
        assert_eq!(
            h.rectifier.room(&room("#a")).expect("tracked").phase,
            RoomPhase::Idle,
            "deferred"
        );

        assert_eq!(drain(&mut h.commands), vec!["JOIN #blocker"]);
        h.rectifier.reconcile(now).expect("reconcile");
        assert_eq!(drain(&mut h.commands), vec!["JOIN #a"], "token was refunded");
    }

    #[test]
    fn rate_limit_spreads_commands_over_time() {
        let config = RectifierConfig {
            tokens_per_second: 0.5,
            burst: 2,
            ..RectifierConfig::default()
        };
        let mut h = harness(config, &["#a", "#b", "#c", "#d"], 16);
        let start = Instant::now();
        h.rectifier.observe_desired();

        h.rectifier.reconcile(start).expect("reconcile");
        assert_eq!(drain(&mut h.commands).len(), 2, "burst");
        h.rectifier
            .reconcile(start + Duration::from_secs(1))
            .expect("reconcile");
        assert!(drain(&mut h.commands).is_empty());
        h.rectifier
            .reconcile(start + Duration::from_secs(2))
            .expect("reconcile");
        assert_eq!(drain(&mut h.commands), vec!["JOIN #c"]);
    }

    #[test]
    fn unwanted_rooms_are_parted_and_complete_on_timeout() {
        let mut h = harness(generous(), &["#a"], 16);
        let start = Instant::now();
        h.rectifier.observe_desired();
        h.rectifier.reconcile(start).expect("join");
        drain(&mut h.commands);
        h.rectifier.observe_signal(MembershipChange {
            op: MembershipOp::Join,
            channel: room("#a"),
        });

        h.desired.publish(snapshot(2, &[]));
        assert!(h.rectifier.observe_desired());
        h.rectifier.reconcile(start).expect("part");
        assert_eq!(drain(&mut h.commands), vec!["PART #a"]);
        assert_eq!(
            h.rectifier.room(&room("#a")).expect("tracked").phase,
            RoomPhase::Parting
        );

        h.rectifier
            .reconcile(start + Duration::from_secs(30))
            .expect("expire");
        let state = h.rectifier.room(&room("#a")).expect("tracked");
        assert_eq!(state.phase, RoomPhase::Idle);
        assert!(!state.have);
        h.rectifier
            .reconcile(start + Duration::from_secs(31))
            .expect("settled");
        assert!(drain(&mut h.commands).is_empty());
    }

    #[test]
    fn rooms_joined_before_startup_are_parted_when_unwanted() {
        let mut h = harness(generous(), &[], 16);
        h.rectifier.observe_desired();
        h.rectifier.observe_signal(MembershipChange {
            op: MembershipOp::Join,
            channel: room("#stale"),
        });
        h.rectifier.reconcile(Instant::now()).expect("reconcile");
        assert_eq!(drain(&mut h.commands), vec!["PART #stale"]);
    }

    #[test]
    fn prune_idle_forgets_settled_rooms() {
        let config = RectifierConfig {
            prune_idle: true,
            ..generous()
        };
        let mut h = harness(config, &["#a"], 16);
        let start = Instant::now();
        h.rectifier.observe_desired();
        h.desired.publish(snapshot(2, &[]));
        h.rectifier.observe_desired();
        h.rectifier.reconcile(start).expect("reconcile");
        assert!(h.rectifier.room(&room("#a")).is_none());
    }

    #[test]
    fn join_abandoned_in_flight_settles_at_its_deadline() {
        let config = RectifierConfig {
            join_timeout: Duration::from_secs(5),
            ..generous()
        };
        let mut h = harness(config, &["#a"], 16);
        let start = Instant::now();
        h.rectifier.observe_desired();
        h.rectifier.reconcile(start).expect("join");
        assert_eq!(drain(&mut h.commands), vec!["JOIN #a"]);

        h.desired.publish(snapshot(2, &[]));
        h.rectifier.observe_desired();
        h.rectifier
            .reconcile(start + Duration::from_secs(5))
            .expect("timeout pass");
        let state = h.rectifier.room(&room("#a")).expect("tracked");
        assert_eq!(state.phase, RoomPhase::Idle);
        assert!(!state.have);
        assert_eq!(state.next_retry_at, None);

        h.rectifier
            .reconcile(start + Duration::from_secs(120))
            .expect("later pass");
        assert!(drain(&mut h.commands).is_empty());
        assert_eq!(h.rectifier.joined_count(), 0);
    }

    #[test]
    fn abandoned_rooms_are_pruned_from_joining_and_error() {
        let config = RectifierConfig {
            join_timeout: Duration::from_secs(5),
            prune_idle: true,
            ..generous()
        };
        let mut h = harness(config, &["#joining", "#failed"], 16);
        let start = Instant::now();
        h.rectifier.observe_desired();
        h.rectifier.reconcile(start).expect("join both");
        h.rectifier
            .reconcile(start + Duration::from_secs(5))
            .expect("both time out");
        h.desired.publish(snapshot(2, &["#joining"]));
        h.rectifier.observe_desired();
        h.rectifier
            .reconcile(start + Duration::from_secs(7))
            .expect("retry");
        drain(&mut h.commands);
        assert!(h.rectifier.room(&room("#failed")).is_none());
        assert_eq!(
            h.rectifier.room(&room("#joining")).expect("tracked").phase,
            RoomPhase::Joining
        );

        h.desired.publish(snapshot(3, &[]));
        h.rectifier.observe_desired();
        h.rectifier
            .reconcile(start + Duration::from_secs(12))
            .expect("second timeout");
        assert_eq!(h.rectifier.rooms().count(), 0);
        assert!(drain(&mut h.commands).is_empty());
    }

    #[test]
    fn closed_command_queue_is_an_error() {
        let mut h = harness(generous(), &["#a"], 4);
        h.rectifier.observe_desired();
        drop(h.commands);
        assert_eq!(
            h.rectifier.reconcile(Instant::now()),
            Err(RectifierError::CommandSinkClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_converges_with_echoed_confirmations() {
        let h = harness(generous(), &["#a", "#b"], 16);
        let Harness {
            rectifier,
            desired,
            signals,
            mut commands,
        } = h;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(rectifier.run(cancel.clone()));

        let mut joined = Vec::new();
        while joined.len() < 2 {
            let cmd = commands.recv().await.expect("command");
            assert_eq!(cmd.op, MembershipOp::Join);
            joined.push(cmd.room.clone());
            signals
                .send(MembershipChange {
                    op: MembershipOp::Join,
                    channel: cmd.room,
                })
                .await
                .expect("signal");
        }
        joined.sort();
        assert_eq!(joined, vec![room("#a"), room("#b")]);

        desired.publish(snapshot(2, &["#b"]));
        let cmd = commands.recv().await.expect("command");
        assert_eq!(cmd, OutboundCommand::part(room("#a")));

        // Ticks keep running; nothing else is issued once converged.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(commands.try_recv().is_err());

        cancel.cancel();
        task.await.expect("join").expect("rectifier");
    }
}
