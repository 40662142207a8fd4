//! The gossip collaborator seam.

use std::time::Duration;

use async_trait::async_trait;
use cairn_types::{ClusterMember, Endpoint};
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Asks a seed node for the cluster's current member list.
#[async_trait]
pub trait GossipClient: Send + Sync + 'static {
    async fn fetch_members(
        &self,
        seed: &Endpoint,
        timeout: Duration,
    ) -> Result<Vec<ClusterMember>, TransportError>;
}

/// The JSON body of a gossip response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDocument {
    pub members: Vec<ClusterMember>,
}

impl GossipDocument {
    pub fn new(members: Vec<ClusterMember>) -> Self {
        Self { members }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Io(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes)
            .map_err(|e| TransportError::Io(format!("malformed gossip document: {e}")))
    }
}
