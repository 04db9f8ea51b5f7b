//! Bounded registry of outstanding request tokens.
//!
//! Every issued request is registered under the logical [`Operation`] it
//! performs.  Exactly one token is current per operation: acquiring a new
//! token for an operation evicts the previous one, so a late answer to a
//! superseded request can never be claimed.
//!
//! [`RequestCorrelator::compare_and_clear`] is the only way to claim a
//! token.  The response path and the timeout path both go through it, so
//! whichever calls it first wins and the other observes `false`.

use std::collections::HashMap;

use cl_protocol::RequestToken;
use parking_lot::Mutex;

/// Logical operation a request token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    SignUp,
    SignIn,
    SignOut,
    RefreshToken,
    Discover,
    Publish(PublishTarget),
}

/// What a publication request covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublishTarget {
    Primary,
    SubDevice(String),
    DeviceProfile,
}

impl PublishTarget {
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }
}

#[derive(Debug)]
struct Entry {
    operation: Operation,
    seq: u64,
}

#[derive(Debug, Default)]
struct Registry {
    tokens: HashMap<RequestToken, Entry>,
    current: HashMap<Operation, RequestToken>,
    next_seq: u64,
}

impl Registry {
    fn insert(&mut self, operation: Operation, token: RequestToken) {
        self.next_seq += 1;
        self.current.insert(operation.clone(), token);
        self.tokens.insert(
            token,
            Entry {
                operation,
                seq: self.next_seq,
            },
        );
    }
}

pub struct RequestCorrelator {
    registry: Mutex<Registry>,
    capacity: usize,
}

impl RequestCorrelator {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity,
        }
    }

    /// Register `token` as the current request for `operation`.
    ///
    /// Returns `false` when the registry is full or the token is already
    /// registered.  A token superseded by this call frees its slot first.
    pub fn acquire(&self, operation: Operation, token: RequestToken) -> bool {
        let mut reg = self.registry.lock();
        if reg.tokens.contains_key(&token) {
            return false;
        }

        let superseded = reg.current.get(&operation).copied();
        let occupied = reg.tokens.len() - usize::from(superseded.is_some());
        if occupied >= self.capacity {
            tracing::warn!(
                capacity = self.capacity,
                operation = ?operation,
                "request registry full"
            );
            return false;
        }

        if let Some(old) = superseded {
            reg.tokens.remove(&old);
            tracing::debug!(token = %old, operation = ?operation, "request superseded");
        }
        reg.insert(operation, token);
        true
    }

    /// Most recently acquired token that has not been cleared.
    pub fn latest(&self) -> Option<RequestToken> {
        let reg = self.registry.lock();
        reg.tokens
            .iter()
            .max_by_key(|(_, e)| e.seq)
            .map(|(token, _)| *token)
    }

    /// Whether `token` is still the current request of its operation.
    pub fn is_current(&self, token: &RequestToken) -> bool {
        self.registry.lock().tokens.contains_key(token)
    }

    pub fn operation_of(&self, token: &RequestToken) -> Option<Operation> {
        self.registry
            .lock()
            .tokens
            .get(token)
            .map(|e| e.operation.clone())
    }

    /// Atomically claim `expected` if it is still current, installing
    /// `replacement` as the new current token for the same operation.
    pub fn compare_and_clear(
        &self,
        expected: RequestToken,
        replacement: Option<RequestToken>,
    ) -> bool {
        let mut reg = self.registry.lock();
        let Some(entry) = reg.tokens.remove(&expected) else {
            return false;
        };
        reg.current.remove(&entry.operation);

        if let Some(next) = replacement {
            if !reg.tokens.contains_key(&next) {
                reg.insert(entry.operation, next);
            }
        }
        true
    }

    /// Drop every outstanding token.
    pub fn clear_all(&self) {
        let mut reg = self.registry.lock();
        let dropped = reg.tokens.len();
        reg.tokens.clear();
        reg.current.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "request registry cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
