//! Explicit process/job context, replacing the source's process-singleton `factory`.
//!
//! Every worker and measurement instance receives a `JobContext` by value (it's cheap
//! to clone — an `Arc` around the client and indexer) instead of reaching into hidden
//! global state.

use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use uuid::Uuid;

use crate::indexer::Indexer;

/// Identity of one process invocation: stamped onto every rendered object's
/// `runid` label, every indexed document, and the job summary.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
}

impl RunContext {
    pub fn new() -> Self {
        Self { run_id: Uuid::new_v4() }
    }

    pub fn label_value(&self) -> String {
        self.run_id.to_string()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a job runner or measurement needs, passed explicitly — no hidden
/// process-wide state (source's `factory` singleton, reimplemented per spec.md §9).
#[derive(Clone)]
pub struct JobContext {
    pub client: Client,
    pub run: RunContext,
    pub indexer: Arc<dyn Indexer>,
    /// CLI `-p key=value` overrides (spec.md §6), merged into the render
    /// context ahead of each object spec's `inputVars`.
    pub cli_vars: Arc<HashMap<String, String>>,
}

impl JobContext {
    pub fn new(client: Client, run: RunContext, indexer: Arc<dyn Indexer>) -> Self {
        Self { client, run, indexer, cli_vars: Arc::new(HashMap::new()) }
    }

    pub fn with_cli_vars(mut self, cli_vars: HashMap<String, String>) -> Self {
        self.cli_vars = Arc::new(cli_vars);
        self
    }
}
