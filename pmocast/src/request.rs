//! Request handles and the outstanding-request discipline.
//!
//! Each asynchronous operation gets a [`RequestId`] when it is accepted.
//! At most one request per [`RequestKind`] is outstanding at a time.
//! Depending on the kind, a new request either replaces the old one
//! (the old one completes with `Replaced`) or is refused with
//! `DuplicateRequest`. A load also cancels an outstanding seek.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{CastError, CastResult};

/// Opaque handle correlating an accepted request with its completion event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    LaunchApplication,
    StopApplication,
    LoadMedia,
    Seek,
    RequestStatus,
}

/// What happens when a request of a kind already outstanding arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The newer request wins.
    Replace,
    /// The newer request is refused.
    Reject,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::LaunchApplication => "launch application",
            RequestKind::StopApplication => "stop application",
            RequestKind::LoadMedia => "load media",
            RequestKind::Seek => "seek",
            RequestKind::RequestStatus => "status",
        }
    }

    pub fn conflict_policy(self) -> ConflictPolicy {
        match self {
            RequestKind::LoadMedia | RequestKind::Seek => ConflictPolicy::Replace,
            RequestKind::LaunchApplication
            | RequestKind::StopApplication
            | RequestKind::RequestStatus => ConflictPolicy::Reject,
        }
    }

    /// Kinds whose outstanding request is cancelled when this one starts.
    pub fn preempts(self) -> &'static [RequestKind] {
        match self {
            RequestKind::LoadMedia => &[RequestKind::Seek],
            _ => &[],
        }
    }
}

/// A request that left the tracker without running to completion.
#[derive(Clone, Debug, PartialEq)]
pub struct Superseded<S> {
    pub request: RequestId,
    pub kind: RequestKind,
    pub sink: S,
    pub error: CastError,
}

#[derive(Clone, Debug)]
struct Pending<S> {
    request: RequestId,
    sink: S,
}

/// Tracks outstanding requests per kind.
///
/// `S` is whatever the caller needs to route the completion (for instance
/// the channel that issued the request).
#[derive(Debug)]
pub struct RequestTracker<S> {
    next_id: u64,
    outstanding: HashMap<RequestKind, Pending<S>>,
}

impl<S: Clone> Default for RequestTracker<S> {
    fn default() -> Self {
        Self {
            next_id: 1,
            outstanding: HashMap::new(),
        }
    }
}

impl<S: Clone> RequestTracker<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new request of `kind`.
    ///
    /// Returns the new id plus every request it displaced, each carrying the
    /// error its completion must report.
    pub fn begin(
        &mut self,
        kind: RequestKind,
        sink: S,
    ) -> CastResult<(RequestId, Vec<Superseded<S>>)> {
        if self.outstanding.contains_key(&kind) && kind.conflict_policy() == ConflictPolicy::Reject
        {
            return Err(CastError::duplicate_request(kind.as_str()));
        }

        let mut superseded = Vec::new();
        if let Some(old) = self.outstanding.remove(&kind) {
            superseded.push(Superseded {
                request: old.request,
                kind,
                sink: old.sink,
                error: CastError::replaced(kind.as_str()),
            });
        }
        for victim in kind.preempts() {
            if let Some(old) = self.outstanding.remove(victim) {
                superseded.push(Superseded {
                    request: old.request,
                    kind: *victim,
                    sink: old.sink,
                    error: CastError::cancelled(victim.as_str(), kind.as_str()),
                });
            }
        }

        let request = RequestId(self.next_id);
        self.next_id += 1;
        self.outstanding.insert(kind, Pending { request, sink });
        Ok((request, superseded))
    }

    /// True while `request` is still the live request of its kind.
    pub fn is_current(&self, kind: RequestKind, request: RequestId) -> bool {
        self.outstanding
            .get(&kind)
            .is_some_and(|pending| pending.request == request)
    }

    /// Marks `request` as done. Returns its sink, or `None` if it had
    /// already been superseded.
    pub fn finish(&mut self, kind: RequestKind, request: RequestId) -> Option<S> {
        if self.is_current(kind, request) {
            self.outstanding.remove(&kind).map(|pending| pending.sink)
        } else {
            None
        }
    }

    /// Removes every outstanding request, reporting `error` for each.
    pub fn drain(&mut self, error: &CastError) -> Vec<Superseded<S>> {
        let mut drained: Vec<Superseded<S>> = self
            .outstanding
            .drain()
            .map(|(kind, pending)| Superseded {
                request: pending.request,
                kind,
                sink: pending.sink,
                error: error.clone(),
            })
            .collect();
        drained.sort_by_key(|s| s.request);
        drained
    }

    /// Removes the outstanding requests of the given kinds.
    pub fn drain_kinds(&mut self, kinds: &[RequestKind], error: &CastError) -> Vec<Superseded<S>> {
        let mut drained = Vec::new();
        for kind in kinds {
            if let Some(pending) = self.outstanding.remove(kind) {
                drained.push(Superseded {
                    request: pending.request,
                    kind: *kind,
                    sink: pending.sink,
                    error: error.clone(),
                });
            }
        }
        drained.sort_by_key(|s| s.request);
        drained
    }

    /// Removes the outstanding requests whose sink satisfies `pred`.
    pub fn drain_matching(
        &mut self,
        pred: impl Fn(&S) -> bool,
        error: &CastError,
    ) -> Vec<Superseded<S>> {
        let kinds: Vec<RequestKind> = self
            .outstanding
            .iter()
            .filter(|(_, pending)| pred(&pending.sink))
            .map(|(kind, _)| *kind)
            .collect();
        self.drain_kinds(&kinds, error)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}
