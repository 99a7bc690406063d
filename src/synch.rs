use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Deadline applied to `arrive` when the configuration does not override it.
pub const DEFAULT_ARRIVAL_DEADLINE: Duration = Duration::from_secs(30);

/// One logical participant in a test case, e.g. `advertiser` or `scanner`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Errors surfaced by [`Rendezvous::arrive`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynchError {
    /// The point was never defined for this rendezvous.
    #[error("rendezvous point `{point}` has not been defined")]
    UnknownPoint { point: String },
    /// The arriving role is not part of the point's expected set.
    #[error("role `{role}` is not expected at rendezvous point `{point}`")]
    UnexpectedRole { point: String, role: Role },
    /// Not every expected role arrived before the deadline. Every blocked
    /// arrival observes this; the next arrival opens a fresh round.
    #[error("rendezvous point `{point}` timed out after {waited}", waited = humantime::format_duration(*deadline))]
    Timeout { point: String, deadline: Duration },
    /// The point was redefined while this role was waiting.
    #[error("rendezvous point `{point}` was invalidated")]
    Invalidated { point: String },
    /// The run was cancelled while waiting.
    #[error("cancelled while waiting at rendezvous point `{point}`")]
    Cancelled { point: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundState {
    Pending,
    Released,
    Invalidated,
}

#[derive(Debug)]
struct Point {
    expected: Vec<Role>,
    arrived: HashSet<Role>,
    round: watch::Sender<RoundState>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Registry {
    points: HashMap<String, Point>,
    next_generation: u64,
}

/// Named rendezvous points coordinating roles within one test case.
///
/// A point releases every waiter at once when the last expected role
/// arrives. A timeout fails every blocked arrival together, and the next
/// arrival opens a fresh round so a retried step can still meet. This
/// replaces the fixed sleeps a naive bridge would use to order two
/// devices' steps.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    registry: Arc<Mutex<Registry>>,
    deadline: Duration,
    cancel: CancellationToken,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new(DEFAULT_ARRIVAL_DEADLINE, CancellationToken::new())
    }
}

impl Rendezvous {
    #[must_use]
    pub fn new(deadline: Duration, cancel: CancellationToken) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            deadline,
            cancel,
        }
    }

    /// Defines (or redefines) a point with its expected role set.
    ///
    /// Redefinition starts a fresh rendezvous: roles still waiting on the
    /// previous definition observe `Invalidated`.
    pub fn define(&self, point: impl Into<String>, roles: impl IntoIterator<Item = Role>) {
        let point = point.into();
        let expected: Vec<Role> = roles.into_iter().collect();
        let mut registry = lock(&self.registry);
        registry.next_generation += 1;
        let generation = registry.next_generation;
        debug!(point, ?expected, "rendezvous point defined");
        registry.points.insert(
            point,
            Point {
                expected,
                arrived: HashSet::new(),
                round: watch::Sender::new(RoundState::Pending),
                generation,
            },
        );
    }

    /// Blocks until every expected role has arrived at `point`.
    ///
    /// # Errors
    ///
    /// [`SynchError::Timeout`] when the rendezvous does not complete within
    /// the deadline, [`SynchError::Invalidated`] when the point is redefined
    /// mid-wait, [`SynchError::Cancelled`] when the run shuts down mid-wait.
    #[instrument(skip(self, role), level = "debug", fields(role = %role))]
    pub async fn arrive(&self, point: &str, role: &Role) -> Result<(), SynchError> {
        let (mut receiver, generation) = match self.check_in(point, role)? {
            CheckIn::Released => return Ok(()),
            CheckIn::Wait {
                receiver,
                generation,
            } => (receiver, generation),
        };

        tokio::select! {
            changed = receiver.changed() => match changed {
                // The sender is dropped when the point is redefined.
                Err(_) => Err(SynchError::Invalidated {
                    point: point.to_owned(),
                }),
                Ok(()) => match *receiver.borrow() {
                    RoundState::Released => Ok(()),
                    RoundState::Invalidated | RoundState::Pending => Err(SynchError::Timeout {
                        point: point.to_owned(),
                        deadline: self.deadline,
                    }),
                },
            },
            () = tokio::time::sleep(self.deadline) => {
                self.settle_timeout(point, generation, &receiver)
            }
            () = self.cancel.cancelled() => Err(SynchError::Cancelled {
                point: point.to_owned(),
            }),
        }
    }

    /// Records the arrival under the registry lock, releasing the round if
    /// this role completes the expected set.
    fn check_in(&self, point: &str, role: &Role) -> Result<CheckIn, SynchError> {
        let mut registry = lock(&self.registry);
        registry.next_generation += 1;
        let fresh_generation = registry.next_generation;
        let entry = registry
            .points
            .get_mut(point)
            .ok_or_else(|| SynchError::UnknownPoint {
                point: point.to_owned(),
            })?;

        let state = *entry.round.borrow();
        match state {
            // The previous round completed or timed out; this arrival opens
            // a new one, so a retried step can rendezvous again.
            RoundState::Released | RoundState::Invalidated => {
                entry.arrived.clear();
                entry.round = watch::Sender::new(RoundState::Pending);
                entry.generation = fresh_generation;
            }
            RoundState::Pending => {}
        }

        if !entry.expected.contains(role) {
            return Err(SynchError::UnexpectedRole {
                point: point.to_owned(),
                role: role.clone(),
            });
        }

        entry.arrived.insert(role.clone());
        let complete = entry
            .expected
            .iter()
            .all(|expected| entry.arrived.contains(expected));
        if complete {
            debug!(point, "rendezvous released");
            entry.round.send_replace(RoundState::Released);
            return Ok(CheckIn::Released);
        }

        Ok(CheckIn::Wait {
            receiver: entry.round.subscribe(),
            generation: entry.generation,
        })
    }

    /// Resolves the deadline branch: release may have won the race, another
    /// waiter may already have invalidated the round, or this waiter is the
    /// first to give up and marks the round failed.
    fn settle_timeout(
        &self,
        point: &str,
        generation: u64,
        receiver: &watch::Receiver<RoundState>,
    ) -> Result<(), SynchError> {
        let mut registry = lock(&self.registry);
        if *receiver.borrow() == RoundState::Released {
            return Ok(());
        }
        if let Some(entry) = registry.points.get_mut(point)
            && entry.generation == generation
            && *entry.round.borrow() == RoundState::Pending
        {
            warn!(point, missing = ?missing_roles(entry), "rendezvous timed out");
            entry.round.send_replace(RoundState::Invalidated);
        }
        Err(SynchError::Timeout {
            point: point.to_owned(),
            deadline: self.deadline,
        })
    }
}

enum CheckIn {
    Released,
    Wait {
        receiver: watch::Receiver<RoundState>,
        generation: u64,
    },
}

fn missing_roles(point: &Point) -> Vec<Role> {
    point
        .expected
        .iter()
        .filter(|role| !point.arrived.contains(role))
        .cloned()
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
