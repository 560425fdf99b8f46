//! Election State Machine
//!
//! Owns this candidate's belief about leadership and moves it between
//! `Follower` and `Leader` using conditional writes against the lease store.
//!
//! Rules:
//! - Every write once the record exists is keyed on a version; nothing is
//!   written unconditionally.
//! - Only a failed conditional write demotes a leader. Transient store
//!   errors and timeouts leave belief untouched until the next tick.
//! - Watch events refresh a follower's cached view of the record but never
//!   change belief and never notify.
//!
//! `tick` and `on_watch_event` run under one async mutex, so local state is
//! only ever mutated by one of them at a time. Belief is mirrored into an
//! atomic so `current_belief` never waits on that mutex.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use super::{Belief, Transition, TransitionEvent, TransitionNotifier};
use crate::clock::{deadline, Timestamp};
use crate::config::ElectionConfig;
use crate::error::{Error, Result};
use crate::lease::{LeaseRecord, LeaseStore, Version, VersionedRecord, WatchEvent};

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Created or took over the lease and became leader
    Acquired(Version),
    /// Renewed our own lease
    Renewed(Version),
    /// A renewal lost a conditional write; now a follower
    Demoted,
    /// Another candidate holds a valid lease
    Following { holder_id: String, expires_at: Timestamp },
    /// Lost an acquisition race to another follower
    Contended,
    /// The store failed or timed out; nothing changed
    StoreError(String),
}

/// Snapshot of a candidate's local state
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStatus {
    pub self_id: String,
    pub key: String,
    pub belief: Belief,
    pub last_known_version: Option<Version>,
    pub holder_id: Option<String>,
    pub expires_at: Option<Timestamp>,
    pub last_renewal_at: Option<Timestamp>,
    pub next_deadline: Option<Timestamp>,
    pub consecutive_failures: u32,
}

/// Candidate local state, guarded by the machine's mutex
#[derive(Debug)]
struct CandidateState {
    belief: Belief,
    /// Fencing token for the next conditional write
    last_known_version: Option<Version>,
    /// Last record we read, wrote or were told about
    cached: Option<LeaseRecord>,
    last_renewal_at: Option<Timestamp>,
    /// Expiry of our own lease while leader
    next_deadline: Option<Timestamp>,
    consecutive_failures: u32,
    /// Sequence number of the last emitted transition
    sequence: u64,
}

/// Lease election state machine for one candidate
pub struct ElectionStateMachine {
    self_id: String,
    key: String,
    lease_duration: Duration,
    store_timeout: Duration,
    store: Arc<dyn LeaseStore>,
    notifier: Arc<TransitionNotifier>,
    state: Mutex<CandidateState>,
    is_leader: AtomicBool,
}

impl ElectionStateMachine {
    /// Create a follower. Fails if the timings are unsafe.
    pub fn new(
        config: &ElectionConfig,
        store: Arc<dyn LeaseStore>,
        notifier: Arc<TransitionNotifier>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            self_id: config.self_id.clone(),
            key: config.key.clone(),
            lease_duration: config.lease_duration(),
            store_timeout: config.store_timeout(),
            store,
            notifier,
            state: Mutex::new(CandidateState {
                belief: Belief::Follower,
                last_known_version: None,
                cached: None,
                last_renewal_at: None,
                next_deadline: None,
                consecutive_failures: 0,
                sequence: 0,
            }),
            is_leader: AtomicBool::new(false),
        })
    }

    /// This candidate's identity
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Election key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current belief. Never blocks.
    pub fn current_belief(&self) -> Belief {
        if self.is_leader.load(Ordering::Acquire) {
            Belief::Leader
        } else {
            Belief::Follower
        }
    }

    /// Snapshot of local state
    pub async fn status(&self) -> CandidateStatus {
        let state = self.state.lock().await;
        CandidateStatus {
            self_id: self.self_id.clone(),
            key: self.key.clone(),
            belief: state.belief,
            last_known_version: state.last_known_version,
            holder_id: state.cached.as_ref().map(|r| r.holder_id.clone()),
            expires_at: state.cached.as_ref().map(|r| r.expires_at),
            last_renewal_at: state.last_renewal_at,
            next_deadline: state.next_deadline,
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Run one acquisition/renewal step at time `now`
    pub async fn tick(&self, now: Timestamp) -> TickOutcome {
        let mut state = self.state.lock().await;

        if state.belief == Belief::Leader {
            return self.renew(&mut state, now).await;
        }

        match self.call(self.store.read(&self.key)).await {
            Ok(None) => self.create(&mut state, now).await,
            Ok(Some(current)) => {
                let record = current.record.clone();
                let version = current.version;
                remember(&mut state, current);

                let ours = record.is_held_by(&self.self_id, now);
                if record.is_held(now) && !ours {
                    state.consecutive_failures = 0;
                    return TickOutcome::Following {
                        holder_id: record.holder_id,
                        expires_at: record.expires_at,
                    };
                }

                if ours {
                    tracing::info!(
                        "Lease {} still names {} as holder, re-adopting it",
                        self.key,
                        self.self_id
                    );
                } else {
                    tracing::debug!(
                        "Lease {} held by {:?} expired at {}, attempting takeover",
                        self.key,
                        record.holder_id,
                        record.expires_at
                    );
                }

                self.take_over(&mut state, now, version).await
            }
            Err(Error::MalformedRecord { version, reason, .. }) => {
                tracing::warn!(
                    "Lease record {} at {} is malformed ({}); treating it as unheld. \
                     Candidates may disagree on the record schema",
                    self.key,
                    version,
                    reason
                );
                state.cached = None;
                state.last_known_version = Some(version);
                self.take_over(&mut state, now, version).await
            }
            Err(e) => self.failed(&mut state, e),
        }
    }

    /// Reconcile a change notification from the store.
    ///
    /// Watch delivery can race with our own renewals, so an event naming
    /// another holder is never taken as proof that we lost the lease. Only
    /// a follower's cached view is refreshed.
    pub async fn on_watch_event(&self, event: WatchEvent) {
        let mut state = self.state.lock().await;

        if state.belief == Belief::Leader {
            if let WatchEvent::Put(ref vr) = event {
                if vr.record.holder_id != self.self_id {
                    tracing::debug!(
                        "Watch reports {} holding {} at {} while we lead; next renewal decides",
                        vr.record.holder_id,
                        self.key,
                        vr.version
                    );
                }
            } else {
                tracing::debug!("Watch reports {:?} on {} while we lead", event, self.key);
            }
            return;
        }

        match event {
            WatchEvent::Put(vr) => {
                let newer = state
                    .last_known_version
                    .map_or(true, |known| vr.version > known);
                if newer {
                    tracing::trace!(
                        "Watch: {} now held by {} until {} ({})",
                        self.key,
                        vr.record.holder_id,
                        vr.record.expires_at,
                        vr.version
                    );
                    remember(&mut state, vr);
                }
            }
            WatchEvent::Malformed { version, reason } => {
                tracing::warn!(
                    "Watch: lease record {} at {} is malformed: {}",
                    self.key,
                    version,
                    reason
                );
                state.cached = None;
                state.last_known_version = Some(version);
            }
            WatchEvent::Deleted => {
                tracing::debug!("Watch: lease record {} was deleted", self.key);
                state.cached = None;
                state.last_known_version = None;
            }
        }
    }

    /// Give up leadership on shutdown.
    ///
    /// When `expire` is set and we lead, the lease is first rewritten to
    /// expire at `now` so a successor can take over without waiting out the
    /// lease. Belief drops to `Follower` whether or not that write lands.
    /// Returns whether the lease was released in the store.
    pub async fn step_down(&self, now: Timestamp, expire: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.belief != Belief::Leader {
            return false;
        }

        let mut released = false;
        if expire {
            if let Some(expected) = state.last_known_version {
                let record = LeaseRecord::new(self.self_id.clone(), now);
                match self
                    .call(self.store.update_if_version(&self.key, &record, expected))
                    .await
                {
                    Ok(version) => {
                        tracing::info!("Released lease {} at {}", self.key, version);
                        state.last_known_version = Some(version);
                        state.cached = Some(record);
                        released = true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Could not release lease {} ({}); successors wait for expiry",
                            self.key,
                            e
                        );
                    }
                }
            }
        }

        self.demote(&mut state, now);
        released
    }

    async fn create(&self, state: &mut CandidateState, now: Timestamp) -> TickOutcome {
        let record = LeaseRecord::new(self.self_id.clone(), deadline(now, self.lease_duration));

        match self.call(self.store.create_if_absent(&self.key, &record)).await {
            Ok(version) => self.promote(state, now, record, version),
            Err(e) if e.is_conflict() => {
                tracing::debug!("Lost creation race for {}", self.key);
                self.refresh(state).await;
                TickOutcome::Contended
            }
            Err(e) => self.failed(state, e),
        }
    }

    async fn take_over(
        &self,
        state: &mut CandidateState,
        now: Timestamp,
        expected: Version,
    ) -> TickOutcome {
        let record = LeaseRecord::new(self.self_id.clone(), deadline(now, self.lease_duration));

        match self
            .call(self.store.update_if_version(&self.key, &record, expected))
            .await
        {
            Ok(version) => self.promote(state, now, record, version),
            Err(e) if e.is_conflict() => {
                tracing::debug!("Lost takeover race for {} at {}", self.key, expected);
                self.refresh(state).await;
                TickOutcome::Contended
            }
            Err(e) => self.failed(state, e),
        }
    }

    async fn renew(&self, state: &mut CandidateState, now: Timestamp) -> TickOutcome {
        let expected = match state.last_known_version {
            Some(version) => version,
            None => {
                // A leader always knows the version it last wrote
                tracing::error!("Leader for {} has no fencing token, stepping down", self.key);
                self.demote(state, now);
                return TickOutcome::Demoted;
            }
        };

        match self.write_renewal(state, now, expected).await {
            Ok(version) => TickOutcome::Renewed(version),
            Err(e) if e.is_conflict() => {
                // A renewal we gave up on may still have committed
                let Some(landed) = self.own_landed_write(now, expected).await else {
                    return self.lose_lease(state, now, e).await;
                };

                tracing::info!(
                    "Renewal of {} at {} hit our own landed write {}, keeping the lease",
                    self.key,
                    expected,
                    landed.version
                );
                let version = landed.version;
                state.next_deadline = Some(landed.record.expires_at);
                remember(state, landed);

                match self.write_renewal(state, now, version).await {
                    Ok(version) => TickOutcome::Renewed(version),
                    Err(e) if e.is_conflict() => self.lose_lease(state, now, e).await,
                    Err(e) => self.failed(state, e),
                }
            }
            Err(e) => self.failed(state, e),
        }
    }

    /// Extend our lease with a write keyed on `expected`
    async fn write_renewal(
        &self,
        state: &mut CandidateState,
        now: Timestamp,
        expected: Version,
    ) -> Result<Version> {
        let record = LeaseRecord::new(self.self_id.clone(), deadline(now, self.lease_duration));
        let version = self
            .call(self.store.update_if_version(&self.key, &record, expected))
            .await?;

        state.last_known_version = Some(version);
        state.next_deadline = Some(record.expires_at);
        state.cached = Some(record);
        state.last_renewal_at = Some(now);
        state.consecutive_failures = 0;
        tracing::trace!("Renewed lease {} at {}", self.key, version);
        Ok(version)
    }

    /// The current record, if it is a still-valid lease we wrote after `expected`.
    ///
    /// Only this candidate writes records naming its id, so such a record is
    /// a renewal that timed out locally but committed in the store.
    async fn own_landed_write(&self, now: Timestamp, expected: Version) -> Option<VersionedRecord> {
        match self.call(self.store.read(&self.key)).await {
            Ok(Some(current))
                if current.version > expected && current.record.is_held_by(&self.self_id, now) =>
            {
                Some(current)
            }
            _ => None,
        }
    }

    async fn lose_lease(
        &self,
        state: &mut CandidateState,
        now: Timestamp,
        error: Error,
    ) -> TickOutcome {
        tracing::warn!(
            "Renewal of {} lost a conditional write ({}), stepping down",
            self.key,
            error
        );
        self.demote(state, now);
        self.refresh(state).await;
        TickOutcome::Demoted
    }

    fn promote(
        &self,
        state: &mut CandidateState,
        now: Timestamp,
        record: LeaseRecord,
        version: Version,
    ) -> TickOutcome {
        state.belief = Belief::Leader;
        state.last_known_version = Some(version);
        state.next_deadline = Some(record.expires_at);
        state.cached = Some(record);
        state.last_renewal_at = Some(now);
        state.consecutive_failures = 0;
        self.is_leader.store(true, Ordering::Release);

        tracing::info!("Acquired lease {} at {}, becoming LEADER", self.key, version);
        self.emit(state, Transition::BecameLeader, now);
        TickOutcome::Acquired(version)
    }

    fn demote(&self, state: &mut CandidateState, now: Timestamp) {
        state.belief = Belief::Follower;
        state.next_deadline = None;
        self.is_leader.store(false, Ordering::Release);

        tracing::info!("Lost lease {}, stepping down to FOLLOWER", self.key);
        self.emit(state, Transition::LostLeadership, now);
    }

    fn failed(&self, state: &mut CandidateState, error: Error) -> TickOutcome {
        state.consecutive_failures += 1;
        if error.is_transient() {
            tracing::warn!(
                "Lease {} attempt failed as {} ({} in a row): {}",
                self.key,
                state.belief,
                state.consecutive_failures,
                error
            );
        } else {
            // Retrying will not fix these; belief is still left alone
            tracing::error!(
                "Lease {} attempt hit a non-transient error as {} ({} in a row): {}",
                self.key,
                state.belief,
                state.consecutive_failures,
                error
            );
        }
        TickOutcome::StoreError(error.to_string())
    }

    /// Re-read the record after losing a race so the next tick starts fresh
    async fn refresh(&self, state: &mut CandidateState) {
        match self.call(self.store.read(&self.key)).await {
            Ok(Some(current)) => remember(state, current),
            Ok(None) => {
                state.cached = None;
                state.last_known_version = None;
            }
            Err(Error::MalformedRecord { version, .. }) => {
                state.cached = None;
                state.last_known_version = Some(version);
            }
            Err(e) => tracing::debug!("Re-read of {} failed: {}", self.key, e),
        }
    }

    fn emit(&self, state: &mut CandidateState, transition: Transition, now: Timestamp) {
        state.sequence += 1;
        self.notifier.publish(TransitionEvent {
            transition,
            candidate_id: self.self_id.clone(),
            sequence: state.sequence,
            at: now,
        });
    }

    /// Bound a store call by the store timeout
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreTimeout(self.store_timeout)),
        }
    }
}

fn remember(state: &mut CandidateState, current: VersionedRecord) {
    state.cached = Some(current.record);
    state.last_known_version = Some(current.version);
}
