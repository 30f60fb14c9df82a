/**
 * coordinator/join.rs
 *
 * Outstanding join requests. A request is keyed by join key until the
 * Coordinator assigns a token, then by token; never both.
 */

use super::types::JoinState;
use super::CoordinatorError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::TcpStream;
use thiserror::Error;

/// Terminal failure of a join, as delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("the Coordinator could not connect us to the server")]
    CoordinatorGaveUp,

    #[error("connection to the Coordinator was lost")]
    SessionLost,

    #[error("a newer request for the same server replaced this one")]
    Superseded,

    #[error("client shut down")]
    Shutdown,
}

/// Called exactly once with the connected socket or the reason there is none
pub type JoinCallback = Box<dyn FnOnce(Result<TcpStream, JoinError>)>;

pub struct PendingJoin {
    pub join_key: String,
    pub state: JoinState,
    callback: JoinCallback,
}

impl PendingJoin {
    pub fn new(join_key: impl Into<String>, callback: JoinCallback) -> Self {
        Self {
            join_key: join_key.into(),
            state: JoinState::Requested,
            callback,
        }
    }

    pub fn deliver(self, result: Result<TcpStream, JoinError>) {
        (self.callback)(result)
    }
}

impl fmt::Debug for PendingJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingJoin")
            .field("join_key", &self.join_key)
            .field("state", &self.state)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct JoinTable {
    by_key: HashMap<String, PendingJoin>,
    by_token: HashMap<String, PendingJoin>,
}

impl JoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request awaiting its token. Returns the request it replaces, if any.
    pub fn insert(&mut self, join: PendingJoin) -> Option<PendingJoin> {
        self.by_key.insert(join.join_key.clone(), join)
    }

    /// Move the request for `join_key` under `token`. Happens once per request.
    pub fn assign_token(&mut self, join_key: &str, token: &str) -> Result<&mut PendingJoin, CoordinatorError> {
        if self.by_token.contains_key(token) {
            return Err(CoordinatorError::DuplicateToken(token.to_string()));
        }
        let mut join = self
            .by_key
            .remove(join_key)
            .ok_or_else(|| CoordinatorError::UnknownJoinKey(join_key.to_string()))?;
        join.state = JoinState::TokenAssigned;

        debug_assert!(!self.by_key.contains_key(join_key));
        Ok(self.by_token.entry(token.to_string()).or_insert(join))
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut PendingJoin> {
        self.by_token.get_mut(token)
    }

    pub fn remove_token(&mut self, token: &str) -> Option<PendingJoin> {
        self.by_token.remove(token)
    }

    pub fn contains_join_key(&self, join_key: &str) -> bool {
        self.by_key.contains_key(join_key)
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.by_token.contains_key(token)
    }

    pub fn state(&self, token: &str) -> Option<&JoinState> {
        self.by_token.get(token).map(|j| &j.state)
    }

    /// Take every outstanding request out of both tables
    pub fn drain(&mut self) -> Vec<PendingJoin> {
        self.by_key
            .drain()
            .map(|(_, j)| j)
            .chain(self.by_token.drain().map(|(_, j)| j))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len() + self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Set of tokens that keeps at most `limit` entries, dropping the oldest
#[derive(Debug)]
pub struct RecentTokens {
    limit: usize,
    order: VecDeque<String>,
    tokens: HashSet<String>,
}

impl RecentTokens {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            tokens: HashSet::new(),
        }
    }

    pub fn insert(&mut self, token: &str) {
        if !self.tokens.insert(token.to_string()) {
            return;
        }
        self.order.push_back(token.to_string());
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.tokens.remove(&oldest);
            }
        }
    }

    /// Forget `token`; true if it was remembered
    pub fn remove(&mut self, token: &str) -> bool {
        if !self.tokens.remove(token) {
            return false;
        }
        self.order.retain(|t| t != token);
        true
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
