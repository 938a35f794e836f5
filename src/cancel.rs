//! Remote query cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::{quote_literal, ServiceClient};

/// Asks the server to abort a running query.
#[async_trait]
pub trait QueryKiller: Send + Sync {
    /// Returns true when the server acknowledged the kill.
    async fn kill_query(&self, query_id: &str) -> bool;
}

/// Issues `KILL QUERY` through a service client.
///
/// A failed kill is logged and reported as `false`; it never raises. The
/// caller tears the local execution down either way.
pub struct CancellationController {
    service: Arc<dyn ServiceClient>,
}

impl CancellationController {
    pub fn new(service: Arc<dyn ServiceClient>) -> Self {
        Self { service }
    }
}

pub(crate) fn kill_query_sql(query_id: &str) -> String {
    format!("KILL QUERY WHERE query_id = {}", quote_literal(query_id))
}

#[async_trait]
impl QueryKiller for CancellationController {
    async fn kill_query(&self, query_id: &str) -> bool {
        match self.service.service_request(&kill_query_sql(query_id)).await {
            // One row per matched query; none means it was no longer running.
            Ok(rows) if !rows.is_empty() => {
                info!(query_id, "kill acknowledged");
                true
            }
            Ok(_) => {
                warn!(query_id, "kill matched no running query");
                false
            }
            Err(e) => {
                warn!(query_id, "kill failed: {e}");
                false
            }
        }
    }
}
