//! Raft member state for one region on one server.
//!
//! # Roles
//!
//! ```text
//!            candidate wait expires            majority of votes
//!  Follower ------------------------> Candidate ----------------> Leader
//!     ^                                   |                         |
//!     +------- higher term seen ----------+-------------------------+
//! ```
//!
//! # Leader round
//!
//! 1. Collect consensus edits from every member's edit queue
//! 2. Assign sequences `{term, last + 1 ..}`, append to the log, apply to
//!    the region store with `version = index`
//! 3. Replicate to followers from each one's last known match point,
//!    rewinding on mismatch
//! 4. Once a majority holds the new entries, trim every member's queue
//!
//! Heartbeats are `AppendEntries` carrying whatever the follower is missing,
//! usually nothing.

use crate::collector::EditCollector;
use crate::config::RaftConfig;
use crate::edit_queue::EditQueue;
use crate::error::{RaftError, Result};
use crate::multicast::Multicast;
use crate::raft_log::{HardState, RaftLog};
use crate::region_store::RegionStore;
use crate::rpc::{AppendReply, RecordsReply, RegionTransport, VoteReply};
use crate::types::{LogEntry, RaftRecord, RaftSequence, RaftStateInfo, Role};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tern_core::{Region, ServerName};
use tern_lsm::{Db, Meter};
use tern_observe::{obs_count, obs_gauge, obs_hist, obs_timed, RaftEvt, RaftKind, TernEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Bound on rewind steps per follower per replication pass.
const MAX_REPLICATION_STEPS: usize = 64;

/// Resources shared by every region a server hosts.
#[derive(Clone)]
pub struct MemberContext {
    pub name: ServerName,
    /// Holds edit queues, raft logs and hard state for all regions.
    pub meta: Arc<Db>,
    pub transport: Arc<dyn RegionTransport>,
    pub meter: Arc<dyn Meter>,
}

struct Volatile {
    role: Role,
    current_term: u64,
    voted_for: Option<ServerName>,
    leader: Option<ServerName>,
    election_deadline: Instant,
    /// Leader only: last sequence each follower is believed to hold.
    next_guess: HashMap<ServerName, RaftSequence>,
    /// Leader only: edit queue sequence to collect from, 0 = first.
    collect_from: BTreeMap<ServerName, u64>,
}

pub struct RaftStates {
    name: ServerName,
    region: Region,
    region_id: String,
    members: Vec<ServerName>,
    config: RaftConfig,
    store: Arc<RegionStore>,
    queue: EditQueue,
    log: RaftLog,
    transport: Arc<dyn RegionTransport>,
    collector: EditCollector,
    meter: Arc<dyn Meter>,
    state: Mutex<Volatile>,
    replicating: tokio::sync::Mutex<()>,
}

impl RaftStates {
    pub fn open(
        ctx: &MemberContext,
        region: Region,
        mut members: Vec<ServerName>,
        config: RaftConfig,
        store: Arc<RegionStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        members.sort();
        members.dedup();
        if !members.contains(&ctx.name) {
            return Err(RaftError::Config(format!(
                "{} is not a member of region {region}",
                ctx.name
            )));
        }

        let region_id = region.id();
        let queue = EditQueue::new(ctx.meta.clone(), format!("edits/{region_id}/"));
        let log = RaftLog::open(ctx.meta.clone(), &format!("raft/{region_id}/"))?;
        let hard = log.hard_state()?;

        tracing::info!(
            region = %region_id,
            member = %ctx.name,
            term = hard.current_term,
            last = %log.last(),
            members = members.len(),
            "opened region member"
        );

        Ok(Arc::new(Self {
            name: ctx.name.clone(),
            region,
            region_id,
            collector: EditCollector::new(ctx.transport.clone(), config.clone()),
            state: Mutex::new(Volatile {
                role: Role::Follower,
                current_term: hard.current_term,
                voted_for: hard.voted_for,
                leader: None,
                election_deadline: Instant::now() + config.random_candidate_wait(),
                next_guess: HashMap::new(),
                collect_from: BTreeMap::new(),
            }),
            members,
            config,
            store,
            queue,
            log,
            transport: ctx.transport.clone(),
            meter: ctx.meter.clone(),
            replicating: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn members(&self) -> &[ServerName] {
        &self.members
    }

    pub fn store(&self) -> &Arc<RegionStore> {
        &self.store
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn leader(&self) -> Option<ServerName> {
        self.state.lock().leader.clone()
    }

    pub fn last_sequence(&self) -> RaftSequence {
        self.log.last()
    }

    pub fn state_info(&self) -> RaftStateInfo {
        let st = self.state.lock();
        RaftStateInfo {
            role: st.role,
            current_term: st.current_term,
            voted_for: st.voted_for.clone(),
            last_sequence: self.log.last(),
            leader: st.leader.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Edit queue operations
    // ------------------------------------------------------------------

    pub async fn append_edit(&self, data: &[u8]) -> Result<u64> {
        self.queue.append_edit(data).await
    }

    pub async fn get_n_records(&self, start: u64, n: u64) -> Result<RecordsReply> {
        let start = match start {
            0 => self.queue.first_sequence().await?,
            s => s,
        };
        let (start_sequence, records) = self.queue.get_n(start, n as usize).await?;
        Ok(RecordsReply {
            ok: true,
            start_sequence,
            records,
        })
    }

    pub async fn trim_edit_queue(&self, end: u64) -> Result<()> {
        self.queue.trim(end).await
    }

    // ------------------------------------------------------------------
    // RPC handlers
    // ------------------------------------------------------------------

    pub fn handle_request_vote(
        &self,
        candidate: &ServerName,
        term: u64,
        last_sequence: RaftSequence,
    ) -> Result<VoteReply> {
        let mut st = self.state.lock();
        if term < st.current_term {
            return Ok(VoteReply {
                ok: false,
                my_term: st.current_term,
            });
        }
        if term > st.current_term {
            self.adopt_term(&mut st, term)?;
        }

        let free = st.voted_for.as_ref().map_or(true, |v| v == candidate);
        let ok = free && last_sequence >= self.log.last();
        if ok {
            st.voted_for = Some(candidate.clone());
            self.persist(&st)?;
            st.election_deadline = self.next_deadline();
        }
        tracing::debug!(
            region = %self.region_id,
            candidate = %candidate,
            term,
            granted = ok,
            "vote requested"
        );
        Ok(VoteReply {
            ok,
            my_term: st.current_term,
        })
    }

    pub fn handle_append_entries(
        &self,
        leader: &ServerName,
        term: u64,
        guessed: RaftSequence,
        entries: Vec<LogEntry>,
    ) -> Result<AppendReply> {
        let mut st = self.state.lock();
        if term < st.current_term {
            return Ok(AppendReply {
                not_leader: true,
                real_sequence: self.log.last(),
                term: st.current_term,
            });
        }
        if term > st.current_term {
            self.adopt_term(&mut st, term)?;
        }
        if st.role != Role::Follower {
            tracing::info!(
                region = %self.region_id,
                term,
                leader = %leader,
                role = %st.role,
                "yielding to leader"
            );
            if st.role == Role::Leader {
                self.emit(term, RaftKind::StepDown);
            }
            st.role = Role::Follower;
        }
        st.leader = Some(leader.clone());
        st.election_deadline = self.next_deadline();

        let last = self.log.last();
        if guessed != last && !self.holds(guessed)? {
            return Ok(AppendReply {
                not_leader: false,
                real_sequence: last,
                term: st.current_term,
            });
        }

        // Skip entries already held; the first conflicting one cuts the log.
        let mut fresh = &entries[..];
        while let Some(first) = fresh.first() {
            match self.log.sequence_at(first.sequence.index)? {
                Some(held) if held == first.sequence => fresh = &fresh[1..],
                Some(_) => {
                    let removed = self.log.truncate_after(first.sequence.index - 1)?;
                    self.unapply(&removed)?;
                    break;
                }
                None => break,
            }
        }
        self.log.append(fresh)?;
        self.apply(fresh)?;

        Ok(AppendReply {
            not_leader: false,
            real_sequence: entries.last().map_or(guessed, |e| e.sequence),
            term: st.current_term,
        })
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Runs elections, heartbeats and leader rounds until `shutdown` fires
    /// or its sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let ticks = tokio::spawn(self.clone().tick_loop(shutdown.resubscribe()));
        let rounds = tokio::spawn(self.clone().collect_loop(shutdown));
        tokio::spawn(async move {
            let _ = ticks.await;
            let _ = rounds.await;
        })
    }

    async fn tick_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_leader() {
                        self.replicate_all().await;
                    } else if self.election_due() {
                        if let Err(e) = self.run_election().await {
                            tracing::warn!(region = %self.region_id, error = %e, "election failed");
                        }
                        if self.is_leader() {
                            self.replicate_all().await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(region = %self.region_id, "tick loop shutting down");
                    break;
                }
            }
        }
    }

    async fn collect_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.collect_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.leader_round().await {
                        tracing::warn!(region = %self.region_id, error = %e, "leader round failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(region = %self.region_id, "collect loop shutting down");
                    break;
                }
            }
        }
    }

    fn election_due(&self) -> bool {
        let st = self.state.lock();
        st.role != Role::Leader && Instant::now() >= st.election_deadline
    }

    pub(crate) async fn run_election(&self) -> Result<()> {
        let (term, last) = {
            let mut st = self.state.lock();
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.name.clone());
            st.leader = None;
            st.election_deadline = self.next_deadline();
            self.persist(&st)?;
            (st.current_term, self.log.last())
        };
        tracing::info!(region = %self.region_id, term, last = %last, "standing for election");
        obs_count!(self.meter, "raft_elections", &[], 1);
        self.emit(term, RaftKind::VoteReq);

        let needed = self.members.len() / 2 + 1;
        let mut votes = 1;
        let calls = self.peers().map(|peer| {
            let transport = self.transport.clone();
            let region = self.region_id.clone();
            let candidate = self.name.clone();
            let target = peer.clone();
            (peer.clone(), async move {
                transport
                    .request_vote(&target, &region, &candidate, term, last)
                    .await
            })
        });
        let mut multicast = Multicast::spawn(calls);
        let deadline = tokio::time::Instant::now() + self.config.request_vote_timeout();

        while votes < needed {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some((peer, reply)) = multicast.wait_one(remaining).await else {
                break;
            };
            match reply {
                Ok(reply) if reply.ok => {
                    votes += 1;
                    self.emit(term, RaftKind::VoteGranted { from: peer.to_string() });
                }
                Ok(reply) if reply.my_term > term => {
                    multicast.close();
                    let mut st = self.state.lock();
                    if reply.my_term > st.current_term {
                        self.adopt_term(&mut st, reply.my_term)?;
                    }
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(region = %self.region_id, peer = %peer, error = %e, "vote request failed");
                }
            }
        }
        multicast.close();

        if votes >= needed {
            self.become_leader(term);
        } else {
            tracing::debug!(region = %self.region_id, term, votes, needed, "election not won");
        }
        Ok(())
    }

    fn become_leader(&self, term: u64) {
        let mut st = self.state.lock();
        if st.role != Role::Candidate || st.current_term != term {
            return;
        }
        let last = self.log.last();
        st.role = Role::Leader;
        st.leader = Some(self.name.clone());
        st.next_guess = self.peers().map(|p| (p.clone(), last)).collect();
        st.collect_from = self.members.iter().map(|m| (m.clone(), 0)).collect();

        tracing::info!(region = %self.region_id, term, last = %last, "became leader");
        obs_count!(self.meter, "raft_leader_elected", &[], 1);
        self.emit(
            term,
            RaftKind::LeaderElected {
                node: self.name.to_string(),
            },
        );
    }

    pub(crate) async fn leader_round(&self) -> Result<()> {
        let (term, starts) = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return Ok(());
            }
            (st.current_term, st.collect_from.clone())
        };

        let collected = obs_timed!(self.meter, "raft_collect_ms", &[], {
            self.collector.collect(&self.region_id, &starts).await
        })?;
        if !collected.rejected.is_empty() {
            let mut st = self.state.lock();
            for member in &collected.rejected {
                st.collect_from.insert(member.clone(), 0);
            }
        }
        if collected.is_empty() {
            return Ok(());
        }

        let entries = {
            let mut st = self.state.lock();
            if st.role != Role::Leader || st.current_term != term {
                return Ok(());
            }
            let base = self.log.last().index;
            let entries: Vec<LogEntry> = collected
                .records
                .iter()
                .enumerate()
                .map(|(i, data)| LogEntry {
                    sequence: RaftSequence::new(term, base + 1 + i as u64),
                    data: data.clone(),
                })
                .collect();
            self.log.append(&entries)?;
            self.apply(&entries)?;
            for (member, end) in &collected.ends {
                st.collect_from.insert(member.clone(), end + 1);
            }
            entries
        };
        tracing::debug!(
            region = %self.region_id,
            term,
            records = entries.len(),
            last = %self.log.last(),
            "committed edits"
        );
        obs_count!(self.meter, "raft_committed_records", &[], entries.len());
        obs_gauge!(self.meter, "raft_last_index", &[], self.log.last().index);
        self.emit(
            term,
            RaftKind::Committed {
                records: entries.len(),
            },
        );

        let holders = self.replicate_all().await;
        obs_hist!(self.meter, "raft_replica_holders", &[], holders);
        if holders > self.members.len() / 2 {
            self.trim_members(&collected.ends).await;
        } else {
            tracing::debug!(region = %self.region_id, holders, "deferring edit queue trim");
        }
        Ok(())
    }

    /// Brings every follower up to the current last entry. Returns how many
    /// members (self included) hold it afterwards.
    pub(crate) async fn replicate_all(&self) -> usize {
        let _pass = self.replicating.lock().await;
        let term = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return 0;
            }
            st.current_term
        };
        let target = self.log.last();

        let peers: Vec<&ServerName> = self.peers().collect();
        let results = join_all(peers.iter().map(|p| self.replicate_to(p, term, target))).await;

        let mut holders = 1;
        for (peer, result) in peers.into_iter().zip(results) {
            match result {
                Ok(true) => holders += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(region = %self.region_id, peer = %peer, error = %e, "replication failed");
                }
            }
        }
        holders
    }

    async fn replicate_to(&self, peer: &ServerName, term: u64, target: RaftSequence) -> Result<bool> {
        for _ in 0..MAX_REPLICATION_STEPS {
            let guess = {
                let st = self.state.lock();
                if st.role != Role::Leader || st.current_term != term {
                    return Ok(false);
                }
                st.next_guess.get(peer).copied().unwrap_or(target)
            };
            let entries = self
                .log
                .read_after(guess.index, self.config.max_records_per_collect as usize)?;
            let sent_end = entries.last().map_or(guess, |e| e.sequence);

            let call = self.transport.append_entries(
                peer,
                &self.region_id,
                &self.name,
                term,
                guess,
                entries,
            );
            let reply = match timeout(self.config.rpc_timeout(), call).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    tracing::debug!(region = %self.region_id, peer = %peer, error = %e, "append entries failed");
                    return Ok(false);
                }
                Err(_) => return Ok(false),
            };

            if reply.term > term {
                let mut st = self.state.lock();
                if reply.term > st.current_term {
                    self.adopt_term(&mut st, reply.term)?;
                }
                return Ok(false);
            }
            if reply.not_leader {
                return Ok(false);
            }

            if reply.real_sequence == sent_end {
                self.state.lock().next_guess.insert(peer.clone(), sent_end);
                if sent_end >= target {
                    return Ok(true);
                }
                continue;
            }

            let rewound = self.rewind(guess, reply.real_sequence)?;
            tracing::debug!(
                region = %self.region_id,
                peer = %peer,
                guess = %guess,
                real = %reply.real_sequence,
                rewound = %rewound,
                "follower log mismatch"
            );
            self.state.lock().next_guess.insert(peer.clone(), rewound);
        }
        Ok(false)
    }

    /// Next guess after a follower rejected `guess` and reported `real`.
    fn rewind(&self, guess: RaftSequence, real: RaftSequence) -> Result<RaftSequence> {
        if real.index < guess.index && self.holds(real)? {
            return Ok(real);
        }
        let index = guess.index.min(real.index).saturating_sub(1);
        Ok(self.log.sequence_at(index)?.unwrap_or(RaftSequence::ZERO))
    }

    async fn trim_members(&self, ends: &BTreeMap<ServerName, u64>) {
        let calls = ends.iter().map(|(member, end)| async move {
            let call = self.transport.trim_edit_queue(member, &self.region_id, end + 1);
            (member, timeout(self.config.rpc_timeout(), call).await)
        });
        for (member, result) in join_all(calls).await {
            if !matches!(result, Ok(Ok(true))) {
                tracing::debug!(region = %self.region_id, member = %member, "edit queue trim not acknowledged");
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn peers(&self) -> impl Iterator<Item = &ServerName> {
        self.members.iter().filter(move |m| **m != self.name)
    }

    fn next_deadline(&self) -> Instant {
        Instant::now() + self.config.random_candidate_wait()
    }

    fn holds(&self, sequence: RaftSequence) -> Result<bool> {
        Ok(self.log.sequence_at(sequence.index)? == Some(sequence))
    }

    fn adopt_term(&self, st: &mut Volatile, term: u64) -> Result<()> {
        let was_leader = st.role == Role::Leader;
        st.current_term = term;
        st.voted_for = None;
        st.role = Role::Follower;
        st.leader = None;
        self.persist(st)?;
        if was_leader {
            tracing::info!(region = %self.region_id, term, "stepping down");
            self.emit(term, RaftKind::StepDown);
        }
        Ok(())
    }

    fn persist(&self, st: &Volatile) -> Result<()> {
        self.log.save_hard_state(&HardState {
            current_term: st.current_term,
            voted_for: st.voted_for.clone(),
        })
    }

    fn apply(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            match RaftRecord::decode(&entry.data) {
                Ok(record) => self.store.put(&record.key, &record.value, entry.sequence.index)?,
                Err(e) => {
                    tracing::warn!(region = %self.region_id, seq = %entry.sequence, error = %e, "skipping undecodable edit");
                }
            }
        }
        Ok(())
    }

    fn unapply(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            if let Ok(record) = RaftRecord::decode(&entry.data) {
                self.store.delete(&record.key, entry.sequence.index)?;
            }
        }
        Ok(())
    }

    fn emit(&self, term: u64, kind: RaftKind) {
        self.meter.emit(TernEvent::Raft(RaftEvt {
            region: self.region_id.clone(),
            term,
            kind,
        }));
    }
}
