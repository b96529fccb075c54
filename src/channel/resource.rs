//! Resource requests and their one-shot completion
//!
//! A request is resolved exactly once: with the resource definition, with a
//! "not found" answer from the provider, or with a provider failure.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Identity of a resource at one provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Uuid of the provider owning the resource
    pub provider_uuid: String,
    /// Resource name, e.g. a class file path
    pub name: String,
}

impl ResourceKey {
    /// Build a key
    pub fn new(provider_uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_uuid: provider_uuid.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_uuid, self.name)
    }
}

/// Request identifier: requester uuid plus a per-requester sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    /// Uuid of the requesting party
    pub requester: Uuid,
    /// Monotonic sequence number
    pub sequence: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.requester, self.sequence)
    }
}

/// What a request asks for, and under which id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Requested resource
    pub key: ResourceKey,
    /// Correlation id
    pub id: RequestId,
}

/// Assigns request ids for one requester
#[derive(Debug)]
pub struct RequestFactory {
    requester: Uuid,
    next: AtomicU64,
}

impl RequestFactory {
    /// Factory for the given requester uuid
    pub fn new(requester: Uuid) -> Self {
        Self {
            requester,
            next: AtomicU64::new(0),
        }
    }

    /// Factory with a random requester uuid
    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Requester uuid
    pub fn requester(&self) -> Uuid {
        self.requester
    }

    /// Next id in sequence
    pub fn next_id(&self) -> RequestId {
        RequestId {
            requester: self.requester,
            sequence: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Descriptor for a resource with a fresh id
    pub fn descriptor(&self, key: ResourceKey) -> ResourceDescriptor {
        ResourceDescriptor {
            key,
            id: self.next_id(),
        }
    }

    /// New request for a resource, with its completion handle
    pub fn request(&self, key: ResourceKey) -> (Arc<ResourceRequest>, PendingResource) {
        ResourceRequest::new(self.descriptor(key))
    }
}

/// Final outcome delivered to the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The resource definition
    Resolved(Bytes),
    /// The provider does not have the resource
    NotFound,
    /// No response available: the provider connection failed
    ProviderError,
}

/// Observable state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Waiting for a response
    Pending,
    /// Resolved with a definition
    Resolved,
    /// Resolved as missing at the provider
    NotFound,
    /// Resolved with a provider failure
    ProviderError,
}

impl RequestOutcome {
    fn state(&self) -> RequestState {
        match self {
            Self::Resolved(_) => RequestState::Resolved,
            Self::NotFound => RequestState::NotFound,
            Self::ProviderError => RequestState::ProviderError,
        }
    }

    /// Whether this outcome is a failure
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Resolved(_))
    }
}

#[derive(Debug)]
struct Completion {
    state: RequestState,
    sender: Option<oneshot::Sender<RequestOutcome>>,
}

/// A pending resource request
#[derive(Debug)]
pub struct ResourceRequest {
    descriptor: ResourceDescriptor,
    created: Instant,
    completion: Mutex<Completion>,
}

impl ResourceRequest {
    /// New pending request and the handle its requester waits on
    pub fn new(descriptor: ResourceDescriptor) -> (Arc<Self>, PendingResource) {
        let (sender, receiver) = oneshot::channel();
        let request = Arc::new(Self {
            descriptor,
            created: Instant::now(),
            completion: Mutex::new(Completion {
                state: RequestState::Pending,
                sender: Some(sender),
            }),
        });
        (request, PendingResource { receiver })
    }

    /// Descriptor of this request
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Requested resource
    pub fn key(&self) -> &ResourceKey {
        &self.descriptor.key
    }

    /// Correlation id
    pub fn id(&self) -> RequestId {
        self.descriptor.id
    }

    /// Current state
    pub fn state(&self) -> RequestState {
        self.completion.lock().state
    }

    /// Time since the request was created
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Resolve the request; only the first call has an effect.
    ///
    /// Returns `true` if this call resolved it.
    pub fn resolve(&self, outcome: RequestOutcome) -> bool {
        let mut completion = self.completion.lock();
        let Some(sender) = completion.sender.take() else {
            return false;
        };
        completion.state = outcome.state();
        // the requester may have stopped waiting
        let _ = sender.send(outcome);
        true
    }
}

/// Handle the requester awaits for the outcome
#[derive(Debug)]
pub struct PendingResource {
    receiver: oneshot::Receiver<RequestOutcome>,
}

impl PendingResource {
    /// Wait for the outcome; a dropped request counts as a provider failure
    pub async fn wait(self) -> RequestOutcome {
        self.receiver.await.unwrap_or(RequestOutcome::ProviderError)
    }

    /// Outcome if already available
    pub fn try_outcome(&mut self) -> Option<RequestOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(RequestOutcome::ProviderError),
        }
    }
}
