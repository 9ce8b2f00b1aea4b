//! Teardown sweep for endpoints and volumes created under a name prefix.
//!
//! Every resource this tool provisions is named `<prefix>-...`, so a sweep
//! lists endpoints and volumes whose names start with the prefix, deletes
//! them (endpoints first, since attached volumes cannot be removed), and
//! fails if anything matching remains afterwards.

mod types;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancel::cancellable;
use crate::volume::VolumeBackend;

pub use types::{SweepPlan, SweepSummary};

/// Configuration for a janitor sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Name prefix selecting the resources to delete.
    pub prefix: String,
    /// Also delete matching network volumes.
    pub include_volumes: bool,
}

impl JanitorConfig {
    /// Constructs a config, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig`] when `prefix` is blank; an empty prefix
    /// would match every resource on the account.
    pub fn new(prefix: impl Into<String>, include_volumes: bool) -> Result<Self, InvalidConfig> {
        let trimmed = prefix.into().trim().to_owned();
        if trimmed.is_empty() {
            return Err(InvalidConfig {
                field: String::from("prefix"),
            });
        }
        Ok(Self {
            prefix: trimmed,
            include_volumes,
        })
    }
}

/// Raised when janitor configuration is missing required values.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("missing {field}")]
pub struct InvalidConfig {
    /// Name of the missing or invalid field.
    pub field: String,
}

/// Errors returned by the janitor.
#[derive(Debug, Error)]
pub enum JanitorError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when listing resources fails.
    #[error("failed to list {resource}: {source}")]
    List {
        /// Resource kind (`endpoints` or `volumes`).
        resource: &'static str,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when deleting a resource fails.
    #[error("failed to delete {resource} {id}: {source}")]
    Delete {
        /// Resource kind.
        resource: &'static str,
        /// Resource identifier.
        id: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when resources remain after the sweep.
    #[error("resources remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
    },
    /// Raised when the caller cancels.
    #[error("janitor sweep cancelled")]
    Cancelled,
}

/// Deletes prefixed endpoints and volumes through a [`VolumeBackend`].
#[derive(Clone, Debug)]
pub struct Janitor<B> {
    config: JanitorConfig,
    backend: B,
}

impl<B: VolumeBackend> Janitor<B> {
    /// Creates a new janitor using the provided configuration and backend.
    #[must_use]
    pub const fn new(config: JanitorConfig, backend: B) -> Self {
        Self { config, backend }
    }

    /// Lists the resources a sweep would delete.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::List`] when either listing fails.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<SweepPlan, JanitorError<B::Error>> {
        let prefix = self.config.prefix.as_str();
        let endpoints = cancellable(
            cancel,
            async {
                self.backend
                    .list_endpoints()
                    .await
                    .map_err(|source| JanitorError::List {
                        resource: "endpoints",
                        source,
                    })
            },
            || JanitorError::Cancelled,
        )
        .await?
        .into_iter()
        .filter(|endpoint| endpoint.name.starts_with(prefix))
        .collect();

        let volumes = if self.config.include_volumes {
            cancellable(
                cancel,
                async {
                    self.backend
                        .list_volumes()
                        .await
                        .map_err(|source| JanitorError::List {
                            resource: "volumes",
                            source,
                        })
                },
                || JanitorError::Cancelled,
            )
            .await?
            .into_iter()
            .filter(|volume| volume.name.starts_with(prefix))
            .collect()
        } else {
            Vec::new()
        };
        Ok(SweepPlan { endpoints, volumes })
    }

    /// Deletes everything in `plan`, then checks that nothing matching
    /// remains.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::Delete`] when an endpoint deletion is
    /// rejected and [`JanitorError::NotClean`] when resources survive the
    /// sweep. Volume deletion failures are logged and surface through the
    /// final check.
    pub async fn sweep(
        &self,
        plan: &SweepPlan,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, JanitorError<B::Error>> {
        let mut summary = SweepSummary::default();
        for endpoint in &plan.endpoints {
            cancellable(
                cancel,
                async {
                    self.backend
                        .delete_endpoint(&endpoint.id)
                        .await
                        .map_err(|source| JanitorError::Delete {
                            resource: "endpoint",
                            id: endpoint.id.clone(),
                            source,
                        })
                },
                || JanitorError::Cancelled,
            )
            .await?;
            info!(endpoint_id = %endpoint.id, name = %endpoint.name, "deleted endpoint");
            summary.deleted_endpoints += 1;
        }

        for volume in &plan.volumes {
            let deleted = cancellable(
                cancel,
                async { self.backend.delete_volume(&volume.id).await.map_err(Some) },
                || None,
            )
            .await;
            match deleted {
                Ok(()) => {
                    info!(volume_id = %volume.id, name = %volume.name, "deleted volume");
                    summary.deleted_volumes += 1;
                }
                Err(None) => return Err(JanitorError::Cancelled),
                Err(Some(source)) => {
                    warn!(volume_id = %volume.id, error = %source, "volume deletion failed");
                }
            }
        }

        let remaining = self.plan(cancel).await?;
        if !remaining.is_empty() {
            let message = format!(
                "endpoints remaining: {}, volumes remaining: {}",
                remaining.endpoint_ids().join(", "),
                remaining.volume_ids().join(", ")
            );
            return Err(JanitorError::NotClean { message });
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests;
