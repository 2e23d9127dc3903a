//! Join-request registry.
//!
//! Tracks requests from devices that want to join a family until an admin
//! resolves them. Every request has exactly one terminal outcome; resolving a
//! request twice is reported, not raised. Outcomes are remembered for the
//! most recent [`RESOLVED_HISTORY`] requests only.

use std::collections::{HashMap, VecDeque};

use sync_types::{DeviceId, FamilyId, JoinRequest, RequestId, Timestamp};

/// Error type for join-request operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The request is not pending (never received, or already resolved).
    UnknownRequest(RequestId),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::UnknownRequest(id) => write!(f, "unknown join request: {}", id),
        }
    }
}

impl std::error::Error for JoinError {}

/// Number of resolved requests whose outcome is remembered.
pub const RESOLVED_HISTORY: usize = 256;

/// Terminal outcome of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// An admin approved the request.
    Approved,
    /// An admin rejected the request.
    Rejected,
}

/// Pending join requests plus the outcomes of resolved ones.
#[derive(Debug, Default)]
pub struct JoinRegistry {
    pending: HashMap<RequestId, JoinRequest>,
    resolved: HashMap<RequestId, JoinOutcome>,
    // Resolution order, oldest first.
    history: VecDeque<RequestId>,
}

impl JoinRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incoming request from `device_id`.
    ///
    /// A device with a request already pending gets that request back instead
    /// of a second one.
    pub fn receive(
        &mut self,
        device_id: DeviceId,
        device_name: impl Into<String>,
        family_id: Option<FamilyId>,
        now: Timestamp,
    ) -> (JoinRequest, bool) {
        self.admit(JoinRequest {
            id: RequestId::new(),
            device_id,
            device_name: device_name.into(),
            family_id,
            requested_at: now,
        })
    }

    /// Record a request created by the requesting device, keeping its id.
    ///
    /// Same deduplication as [`receive`](Self::receive). A request that was
    /// already resolved is returned as not new and stays resolved.
    pub fn admit(&mut self, request: JoinRequest) -> (JoinRequest, bool) {
        if let Some(existing) = self
            .pending
            .values()
            .find(|r| r.device_id == request.device_id)
        {
            return (existing.clone(), false);
        }
        if self.resolved.contains_key(&request.id) {
            return (request, false);
        }
        self.pending.insert(request.id, request.clone());
        (request, true)
    }

    /// Approve a pending request, removing it from the pending set.
    pub fn approve(&mut self, id: RequestId) -> Result<JoinRequest, JoinError> {
        let request = self
            .pending
            .remove(&id)
            .ok_or(JoinError::UnknownRequest(id))?;
        self.resolve(id, JoinOutcome::Approved);
        Ok(request)
    }

    /// Reject a pending request. Returns `None` if it was not pending.
    pub fn reject(&mut self, id: RequestId) -> Option<JoinRequest> {
        let request = self.pending.remove(&id)?;
        self.resolve(id, JoinOutcome::Rejected);
        Some(request)
    }

    /// Pending requests, oldest first.
    pub fn pending(&self) -> Vec<JoinRequest> {
        let mut requests: Vec<JoinRequest> = self.pending.values().cloned().collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Whether `id` is waiting for a decision.
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Outcome of a resolved request.
    pub fn outcome(&self, id: RequestId) -> Option<JoinOutcome> {
        self.resolved.get(&id).copied()
    }

    /// Number of remembered outcomes.
    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }

    fn resolve(&mut self, id: RequestId, outcome: JoinOutcome) {
        self.resolved.insert(id, outcome);
        self.history.push_back(id);
        while self.history.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.history.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(b: u8) -> DeviceId {
        DeviceId::from_bytes(&[b; 32]).unwrap()
    }

    #[test]
    fn receive_adds_pending_request() {
        let mut registry = JoinRegistry::new();
        let (request, new) = registry.receive(device(1), "Tablet", None, 100);

        assert!(new);
        assert!(registry.is_pending(request.id));
        assert_eq!(registry.pending(), vec![request]);
    }

    #[test]
    fn repeated_request_from_same_device_is_deduplicated() {
        let mut registry = JoinRegistry::new();
        let (first, _) = registry.receive(device(1), "Tablet", None, 100);
        let (second, new) = registry.receive(device(1), "Tablet", None, 200);

        assert!(!new);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.pending().len(), 1);
    }

    #[test]
    fn approve_resolves_once() {
        let mut registry = JoinRegistry::new();
        let (request, _) = registry.receive(device(1), "Tablet", None, 100);

        assert_eq!(registry.approve(request.id).unwrap().device_id, device(1));
        assert_eq!(registry.outcome(request.id), Some(JoinOutcome::Approved));
        assert_eq!(
            registry.approve(request.id),
            Err(JoinError::UnknownRequest(request.id))
        );
        assert!(registry.reject(request.id).is_none());
        assert_eq!(registry.outcome(request.id), Some(JoinOutcome::Approved));
    }

    #[test]
    fn reject_unknown_is_benign() {
        let mut registry = JoinRegistry::new();
        assert!(registry.reject(RequestId::new()).is_none());
    }

    #[test]
    fn rejected_request_cannot_be_approved() {
        let mut registry = JoinRegistry::new();
        let (request, _) = registry.receive(device(2), "Phone", None, 100);

        assert!(registry.reject(request.id).is_some());
        assert!(registry.approve(request.id).is_err());
        assert_eq!(registry.outcome(request.id), Some(JoinOutcome::Rejected));
    }

    #[test]
    fn pending_is_oldest_first() {
        let mut registry = JoinRegistry::new();
        registry.receive(device(1), "B", None, 300);
        registry.receive(device(2), "A", None, 100);

        let names: Vec<String> = registry.pending().into_iter().map(|r| r.device_name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn resolved_history_is_bounded() {
        let mut registry = JoinRegistry::new();
        let mut ids = Vec::new();
        for i in 0..RESOLVED_HISTORY + 10 {
            let device = device((i % 250) as u8);
            let (request, _) = registry.receive(device, "Tablet", None, i as u64);
            if i % 2 == 0 {
                registry.approve(request.id).unwrap();
            } else {
                registry.reject(request.id).unwrap();
            }
            ids.push(request.id);
        }

        assert_eq!(registry.resolved_len(), RESOLVED_HISTORY);
        assert_eq!(registry.outcome(ids[0]), None);
        assert_eq!(registry.outcome(ids[9]), None);
        assert_eq!(registry.outcome(ids[10]), Some(JoinOutcome::Approved));
        assert_eq!(
            registry.outcome(*ids.last().unwrap()),
            Some(JoinOutcome::Rejected)
        );
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn admit_keeps_requester_id() {
        let mut registry = JoinRegistry::new();
        let request = JoinRequest {
            id: RequestId::new(),
            device_id: device(3),
            device_name: "Laptop".into(),
            family_id: None,
            requested_at: 50,
        };

        let (admitted, new) = registry.admit(request.clone());
        assert!(new);
        assert_eq!(admitted.id, request.id);

        registry.approve(request.id).unwrap();
        let (_, new) = registry.admit(request.clone());
        assert!(!new);
        assert!(!registry.is_pending(request.id));
    }
}
