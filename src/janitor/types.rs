//! Types used by the janitor.

use crate::backend::Endpoint;
use crate::volume::NetworkVolume;

/// Resources selected for deletion.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepPlan {
    /// Endpoints whose names match the prefix.
    pub endpoints: Vec<Endpoint>,
    /// Volumes whose names match the prefix.
    pub volumes: Vec<NetworkVolume>,
}

impl SweepPlan {
    /// Returns `true` when nothing matches.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.volumes.is_empty()
    }

    /// Identifiers of the matching endpoints.
    #[must_use]
    pub fn endpoint_ids(&self) -> Vec<&str> {
        self.endpoints.iter().map(|endpoint| endpoint.id.as_str()).collect()
    }

    /// Identifiers of the matching volumes.
    #[must_use]
    pub fn volume_ids(&self) -> Vec<&str> {
        self.volumes.iter().map(|volume| volume.id.as_str()).collect()
    }
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Number of endpoints deleted during the sweep.
    pub deleted_endpoints: usize,
    /// Number of volumes deleted during the sweep.
    pub deleted_volumes: usize,
}
