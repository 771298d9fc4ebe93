//! Kubernetes client plumbing: connection bootstrap, the typed API Gateway
//! (C2), and the generic resource Watcher (C5).

pub mod client;
pub mod gateway;
pub mod watcher;
