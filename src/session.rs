//! Session and query identity.
//!
//! A session id is generated once when the process builds its
//! [`SessionContext`]; every query executed through that context gets a fresh
//! query id. Both are correlation keys only: progress lookups and kill
//! commands use them to find the running query on the server.

use std::fmt;
use uuid::Uuid;

/// Process-lifetime context. Construct one at startup and pass it around.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: String,
}

impl SessionContext {
    /// Creates a context with a freshly generated session id.
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context around a known session id.
    pub fn with_session_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    /// Returns the session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Generates the identity for one query invocation.
    pub fn new_query(&self) -> QueryIdentity {
        QueryIdentity {
            session_id: self.session_id.clone(),
            query_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a single query execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryIdentity {
    session_id: String,
    query_id: String,
}

impl QueryIdentity {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.query_id)
    }
}
