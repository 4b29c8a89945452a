//! Peer Connection Registry.
//!
//! One registry per stream class, owned by the session actor. Keyed by remote
//! user id, so at most one negotiator exists per `(remote_id, class)`.
//! Replacing an entry closes the previous negotiator before the new one is
//! inserted; the generation counter lets the session drop late output from a
//! replaced negotiator.
//!
//! Candidates that arrive for a remote with no negotiator yet are stashed
//! here and handed to the next negotiator created for that remote. Each entry
//! also keeps the candidates it was handed; a replacement inherits them, since
//! a remote's candidates can overtake the offer that replaces its negotiator.
//! A stash nobody claims within the negotiation timeout is discarded.

use super::messages::{NegotiatorEvent, NegotiatorKey, Role, StreamClass};
use super::metrics::{ActorMetrics, ActorType};
use super::negotiator::{NegotiatorActor, NegotiatorHandle, NegotiatorSettings};
use crate::observability::metrics as call_metrics;
use crate::peer::{IceCandidate, PeerConnectionFactory};

use common::types::UserId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `remove_all` waits for one negotiator to finish closing.
const NEGOTIATOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to spawn negotiators for one session.
#[derive(Clone)]
pub struct NegotiatorSpawner {
    factory: Arc<dyn PeerConnectionFactory>,
    output: mpsc::UnboundedSender<NegotiatorEvent>,
    settings: NegotiatorSettings,
    parent_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
}

impl NegotiatorSpawner {
    #[must_use]
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        output: mpsc::UnboundedSender<NegotiatorEvent>,
        settings: NegotiatorSettings,
        parent_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            factory,
            output,
            settings,
            parent_token,
            metrics,
        }
    }

    fn spawn(&self, key: NegotiatorKey, generation: u64) -> (NegotiatorHandle, JoinHandle<()>) {
        NegotiatorActor::spawn(
            key,
            generation,
            Arc::clone(&self.factory),
            self.output.clone(),
            self.settings,
            self.parent_token.child_token(),
            Arc::clone(&self.metrics),
        )
    }
}

/// Internal state for a managed negotiator.
struct ManagedNegotiator {
    handle: NegotiatorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
    role: Role,
    /// Caller only: the remote answer has been delivered.
    answered: bool,
    /// Remote candidates handed to this negotiator, newest last.
    delivered: VecDeque<IceCandidate>,
}

/// Candidates waiting for a negotiator.
struct Stash {
    candidates: VecDeque<IceCandidate>,
    updated: Instant,
}

/// Negotiators of one stream class, keyed by remote user id.
pub struct PeerConnectionRegistry {
    class: StreamClass,
    spawner: NegotiatorSpawner,
    entries: HashMap<UserId, ManagedNegotiator>,
    stash: HashMap<UserId, Stash>,
    max_stashed: usize,
    stash_ttl: Duration,
    next_generation: u64,
}

impl PeerConnectionRegistry {
    #[must_use]
    pub fn new(class: StreamClass, spawner: NegotiatorSpawner) -> Self {
        let max_stashed = spawner.settings.max_pending_candidates;
        let stash_ttl = spawner.settings.timeout;
        Self {
            class,
            spawner,
            entries: HashMap::new(),
            stash: HashMap::new(),
            max_stashed,
            stash_ttl,
            next_generation: 1,
        }
    }

    #[must_use]
    pub fn class(&self) -> StreamClass {
        self.class
    }

    #[must_use]
    pub fn get(&self, remote_id: &UserId) -> Option<&NegotiatorHandle> {
        self.entries.get(remote_id).map(|managed| &managed.handle)
    }

    /// True when this side sent an offer to `remote_id` and has no answer yet.
    #[must_use]
    pub fn awaiting_answer(&self, remote_id: &UserId) -> bool {
        self.entries
            .get(remote_id)
            .is_some_and(|managed| managed.role == Role::Caller && !managed.answered)
    }

    /// Record that the remote answer was handed to the caller negotiator.
    pub fn mark_answered(&mut self, remote_id: &UserId) {
        if let Some(managed) = self.entries.get_mut(remote_id) {
            managed.answered = true;
        }
    }

    /// Existing negotiator for `remote_id`, or a new one in `role`.
    pub fn get_or_create(&mut self, remote_id: &UserId, role: Role) -> NegotiatorHandle {
        if let Some(managed) = self.entries.get(remote_id) {
            return managed.handle.clone();
        }
        self.insert_new(remote_id, role)
    }

    /// Close any negotiator for `remote_id` and start a fresh one in `role`.
    ///
    /// Candidates the previous negotiator was handed go to the new one.
    pub fn replace(&mut self, remote_id: &UserId, role: Role) -> NegotiatorHandle {
        if let Some(mut previous) = self.entries.remove(remote_id) {
            let inherited = std::mem::take(&mut previous.delivered);
            debug!(
                target: "call.actor.registry",
                remote_id = %remote_id,
                class = %self.class,
                generation = previous.handle.generation(),
                inherited = inherited.len(),
                "Replacing negotiator"
            );
            self.retire(remote_id, previous);
            self.restash(remote_id, inherited);
        }
        self.get_or_create(remote_id, role)
    }

    /// Close and discard the negotiator for `remote_id`. Returns true if one
    /// existed. Stashed candidates for that remote are dropped too.
    pub fn remove(&mut self, remote_id: &UserId) -> bool {
        self.stash.remove(remote_id);
        let removed = match self.entries.remove(remote_id) {
            Some(managed) => {
                self.retire(remote_id, managed);
                true
            }
            None => false,
        };
        if removed {
            self.publish_gauge();
            info!(
                target: "call.actor.registry",
                remote_id = %remote_id,
                class = %self.class,
                remaining = self.entries.len(),
                "Negotiator removed"
            );
        }
        removed
    }

    /// Close every negotiator and wait for each to finish closing.
    pub async fn remove_all(&mut self) {
        self.stash.clear();
        if self.entries.is_empty() {
            return;
        }

        for managed in self.entries.values() {
            managed.handle.close();
        }

        for (remote_id, managed) in self.entries.drain() {
            match tokio::time::timeout(NEGOTIATOR_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "call.actor.registry",
                        remote_id = %remote_id,
                        class = %self.class,
                        error = ?e,
                        "Negotiator task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.actor.registry",
                        remote_id = %remote_id,
                        class = %self.class,
                        "Negotiator shutdown timed out"
                    );
                }
            }
        }

        self.publish_gauge();
        debug!(
            target: "call.actor.registry",
            class = %self.class,
            "All negotiators removed"
        );
    }

    /// Hand a remote candidate to the live negotiator for `remote_id`, or
    /// stash it until one exists.
    pub fn deliver_candidate(&mut self, remote_id: &UserId, candidate: IceCandidate) {
        let limit = self.max_stashed;
        let Some(managed) = self.entries.get_mut(remote_id) else {
            debug!(
                target: "call.actor.registry",
                remote_id = %remote_id,
                class = %self.class,
                "Candidate before negotiator, stashing"
            );
            self.stash_candidate(remote_id, candidate);
            return;
        };

        match managed.handle.add_remote_candidate(candidate.clone()) {
            Ok(()) => push_bounded(&mut managed.delivered, candidate, limit),
            Err(e) => {
                warn!(
                    target: "call.actor.registry",
                    remote_id = %remote_id,
                    class = %self.class,
                    error = %e,
                    "Remote candidate dropped"
                );
            }
        }
    }

    /// Hold a candidate for a remote that has no negotiator yet.
    fn stash_candidate(&mut self, remote_id: &UserId, candidate: IceCandidate) {
        if self.max_stashed == 0 {
            return;
        }
        let stash = self.stash.entry(remote_id.clone()).or_insert_with(|| Stash {
            candidates: VecDeque::new(),
            updated: Instant::now(),
        });
        stash.updated = Instant::now();
        if stash.candidates.len() >= self.max_stashed {
            warn!(
                target: "call.actor.registry",
                remote_id = %remote_id,
                class = %self.class,
                limit = self.max_stashed,
                "Stashed candidate limit reached, dropping oldest"
            );
        }
        push_bounded(&mut stash.candidates, candidate, self.max_stashed);
        call_metrics::record_candidate_queued(self.class.as_str());
    }

    /// Put a replaced negotiator's candidates ahead of anything stashed since.
    fn restash(&mut self, remote_id: &UserId, mut inherited: VecDeque<IceCandidate>) {
        if inherited.is_empty() {
            return;
        }
        if let Some(stash) = self.stash.remove(remote_id) {
            inherited.extend(stash.candidates);
        }
        while inherited.len() > self.max_stashed {
            inherited.pop_front();
        }
        self.stash.insert(
            remote_id.clone(),
            Stash {
                candidates: inherited,
                updated: Instant::now(),
            },
        );
    }

    #[must_use]
    pub fn stashed(&self, remote_id: &UserId) -> usize {
        self.stash.get(remote_id).map_or(0, |stash| stash.candidates.len())
    }

    /// Drop stashes no negotiator claimed within the negotiation timeout.
    ///
    /// Returns how many remotes' stashes were dropped.
    pub fn expire_stash(&mut self) -> usize {
        let ttl = self.stash_ttl;
        let before = self.stash.len();
        self.stash.retain(|_, stash| stash.updated.elapsed() < ttl);
        let expired = before - self.stash.len();
        if expired > 0 {
            debug!(
                target: "call.actor.registry",
                class = %self.class,
                expired,
                "Unclaimed candidate stashes expired"
            );
        }
        expired
    }

    /// Whether output tagged `generation` comes from the live negotiator.
    #[must_use]
    pub fn is_current(&self, remote_id: &UserId, generation: u64) -> bool {
        self.entries
            .get(remote_id)
            .is_some_and(|managed| managed.handle.generation() == generation)
    }

    /// Remote ids with a live negotiator, sorted.
    #[must_use]
    pub fn remote_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove negotiators whose task ended without reporting termination.
    ///
    /// Returns the affected remote ids.
    pub async fn reap_finished(&mut self) -> Vec<UserId> {
        let finished: Vec<UserId> = self
            .entries
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(remote_id, _)| remote_id.clone())
            .collect();

        for remote_id in &finished {
            if let Some(managed) = self.entries.remove(remote_id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        debug!(
                            target: "call.actor.registry",
                            remote_id = %remote_id,
                            class = %self.class,
                            "Negotiator task exited"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "call.actor.registry",
                                remote_id = %remote_id,
                                class = %self.class,
                                error = ?join_error,
                                "Negotiator actor panicked"
                            );
                            self.spawner.metrics.record_panic(ActorType::Negotiator);
                        }
                    }
                }
            }
        }

        if !finished.is_empty() {
            self.publish_gauge();
        }
        finished
    }

    fn insert_new(&mut self, remote_id: &UserId, role: Role) -> NegotiatorHandle {
        let generation = self.next_generation;
        self.next_generation += 1;

        let key = NegotiatorKey::new(remote_id.clone(), self.class);
        let (handle, task_handle) = self.spawner.spawn(key, generation);

        let mut delivered = VecDeque::new();
        if let Some(stash) = self.stash.remove(remote_id) {
            let count = stash.candidates.len();
            for candidate in stash.candidates {
                match handle.add_remote_candidate(candidate.clone()) {
                    Ok(()) => push_bounded(&mut delivered, candidate, self.max_stashed),
                    Err(e) => {
                        warn!(
                            target: "call.actor.registry",
                            remote_id = %remote_id,
                            class = %self.class,
                            error = %e,
                            "Failed to hand stashed candidate to negotiator"
                        );
                    }
                }
            }
            debug!(
                target: "call.actor.registry",
                remote_id = %remote_id,
                class = %self.class,
                count,
                "Stashed candidates handed to new negotiator"
            );
        }

        self.entries.insert(
            remote_id.clone(),
            ManagedNegotiator {
                handle: handle.clone(),
                task_handle,
                role,
                answered: false,
                delivered,
            },
        );
        self.publish_gauge();

        debug!(
            target: "call.actor.registry",
            remote_id = %remote_id,
            class = %self.class,
            generation,
            role = ?role,
            "Negotiator created"
        );

        handle
    }

    /// Close a negotiator without blocking the session loop.
    fn retire(&self, remote_id: &UserId, managed: ManagedNegotiator) {
        managed.handle.close();

        let remote_id = remote_id.clone();
        let class = self.class;
        tokio::spawn(async move {
            match tokio::time::timeout(NEGOTIATOR_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "call.actor.registry",
                        remote_id = %remote_id,
                        class = %class,
                        error = ?e,
                        "Negotiator task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.actor.registry",
                        remote_id = %remote_id,
                        class = %class,
                        "Negotiator task cleanup timed out"
                    );
                }
            }
        });
    }

    fn publish_gauge(&self) {
        call_metrics::set_negotiators_active(self.class.as_str(), self.entries.len());
    }
}

fn push_bounded(queue: &mut VecDeque<IceCandidate>, candidate: IceCandidate, limit: usize) {
    if limit == 0 {
        return;
    }
    while queue.len() >= limit {
        queue.pop_front();
    }
    queue.push_back(candidate);
}
