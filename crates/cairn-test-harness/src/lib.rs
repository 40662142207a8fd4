//! # cairn-test-harness: an in-process cluster for client tests
//!
//! [`FakeCluster`] stands in for a real cluster behind the client's
//! transport and gossip seams. Nodes share a single in-memory event log and
//! can be taken down, re-elected, slowed down or made to swallow traffic,
//! so the connection engine's failure handling can be driven from a test.
//!
//! ```ignore
//! let cluster = FakeCluster::new(3);
//! let connection = cluster.connection(&cluster.cluster_options())?;
//! connection.connect().await?;
//!
//! cluster.set_node_alive(0, false);
//! cluster.set_leader(1);
//! ```

mod cluster;
mod server;
pub mod store;

pub use cluster::{FakeCluster, NODE_HTTP_PORT, NODE_TCP_PORT};
pub use server::{RequestRecord, Stats};
pub use store::EventStore;

use std::time::Duration;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds. Panics once `timeout` has passed.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
