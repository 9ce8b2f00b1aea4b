//! Endpoint lifecycle management.
//!
//! Endpoints are looked up by name prefix before any creation attempt so
//! repeated runs share one deployment. Two processes provisioning the same
//! prefix at the same moment can still both create one; the provider offers
//! no create-if-absent primitive.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendError, ComputeBackend, Endpoint, EndpointSpec};
use crate::cancel::cancellable;

/// Worker template for the media engine model.
pub const FFMPEG_TEMPLATE_ID: &str = "uduo7jdyhn";
/// Worker template for the super-resolution model.
pub const REAL_ESRGAN_TEMPLATE_ID: &str = "047z8w5i69";
/// Model served by the media engine worker.
pub const FFMPEG_MODEL: &str = "ffmpeg";
/// Default image model.
pub const DEFAULT_IMAGE_MODEL: &str = "real-esrgan";

/// Compute classes offered when the caller does not pick one.
pub const DEFAULT_COMPUTE_CLASSES: &[&str] = &[
    "NVIDIA RTX A4000",
    "NVIDIA RTX A4500",
    "NVIDIA RTX 4000 Ada Generation",
    "NVIDIA RTX 4000 SFF Ada Generation",
    "NVIDIA RTX 2000 Ada Generation",
    "NVIDIA RTX A2000",
];

/// Payload family a remote model expects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModelKind {
    /// General media engine worker taking an argument string.
    Ffmpeg,
    /// Image model taking an image and a scale.
    Image,
}

impl ModelKind {
    /// Classifies `model` by name.
    #[must_use]
    pub fn of(model: &str) -> Self {
        if model == FFMPEG_MODEL {
            Self::Ffmpeg
        } else {
            Self::Image
        }
    }
}

/// Endpoint name used for `model` under `prefix`.
#[must_use]
pub fn endpoint_name_for_model(prefix: &str, model: &str) -> String {
    match model {
        FFMPEG_MODEL => format!("{prefix}-ffmpeg"),
        "" | DEFAULT_IMAGE_MODEL => format!("{prefix}-img-{DEFAULT_IMAGE_MODEL}"),
        other => format!("{prefix}-img-{other}"),
    }
}

/// Worker template for `model`, if the tool knows how to provision it.
#[must_use]
pub fn template_for_model(model: &str) -> Option<&'static str> {
    match model {
        FFMPEG_MODEL => Some(FFMPEG_TEMPLATE_ID),
        "" | DEFAULT_IMAGE_MODEL => Some(REAL_ESRGAN_TEMPLATE_ID),
        _ => None,
    }
}

/// Builds a provisioning spec for `model`.
///
/// `compute_class` narrows the class list to one entry; otherwise
/// [`DEFAULT_COMPUTE_CLASSES`] is used.
///
/// # Errors
///
/// Returns [`BackendError::Validation`] when the model has no known template
/// or a field is empty.
pub fn provision_spec(
    prefix: &str,
    model: &str,
    compute_class: Option<&str>,
    data_centers: Vec<String>,
    workers_min: u32,
) -> Result<EndpointSpec, BackendError> {
    let template = template_for_model(model)
        .ok_or_else(|| BackendError::Validation(format!("template for model '{model}'")))?;
    let compute_classes = compute_class.map_or_else(
        || {
            DEFAULT_COMPUTE_CLASSES
                .iter()
                .map(|class| (*class).to_owned())
                .collect()
        },
        |class| vec![class.to_owned()],
    );
    EndpointSpec::builder()
        .name(endpoint_name_for_model(prefix, model))
        .template_id(template)
        .compute_classes(compute_classes)
        .data_centers(data_centers)
        .workers_min(workers_min)
        .build()
}

/// Errors raised while managing endpoints.
#[derive(Debug, Error)]
pub enum EndpointError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when listing endpoints fails where the listing is required.
    #[error("failed to list endpoints: {0}")]
    List(#[source] E),
    /// Raised when no endpoint matches and no provisioning spec was given.
    #[error("no endpoint matches prefix '{prefix}' and none can be provisioned")]
    NotFound {
        /// Name prefix that was searched.
        prefix: String,
    },
    /// Raised when the provider rejects endpoint creation.
    #[error("failed to create endpoint {name}: {source}")]
    Create {
        /// Requested endpoint name.
        name: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when deleting an endpoint fails.
    #[error("failed to delete endpoint {endpoint_id}: {source}")]
    Delete {
        /// Endpoint being deleted.
        endpoint_id: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when the caller cancels.
    #[error("endpoint operation cancelled")]
    Cancelled,
}

/// Finds, provisions and removes endpoints through a [`ComputeBackend`].
#[derive(Clone, Debug)]
pub struct EndpointManager<B> {
    backend: B,
}

impl<B> EndpointManager<B>
where
    B: ComputeBackend,
{
    /// Creates a manager over `backend`.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the first endpoint whose name starts with `prefix`, creating
    /// one from `spec` when none matches.
    ///
    /// A failed listing is logged and treated as "not found" so a transient
    /// error never blocks provisioning.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotFound`] when nothing matches and `spec` is
    /// `None`, [`EndpointError::Create`] when creation fails, and
    /// [`EndpointError::Cancelled`] when `cancel` fires.
    pub async fn ensure_endpoint(
        &self,
        prefix: &str,
        spec: Option<&EndpointSpec>,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, EndpointError<B::Error>> {
        match self.list_endpoints(prefix, cancel).await {
            Ok(matches) => {
                if let Some(existing) = matches.into_iter().next() {
                    info!(endpoint_id = %existing.id, name = %existing.name, "using existing endpoint");
                    return Ok(existing);
                }
            }
            Err(EndpointError::Cancelled) => return Err(EndpointError::Cancelled),
            Err(err) => {
                warn!(prefix, error = %err, "listing endpoints failed; treating as not found");
            }
        }

        let Some(provision) = spec else {
            return Err(EndpointError::NotFound {
                prefix: prefix.to_owned(),
            });
        };
        info!(name = %provision.name, "creating endpoint");
        let created = cancellable(
            cancel,
            async {
                self.backend
                    .create_endpoint(provision)
                    .await
                    .map_err(|source| EndpointError::Create {
                        name: provision.name.clone(),
                        source,
                    })
            },
            || EndpointError::Cancelled,
        )
        .await?;
        info!(endpoint_id = %created.id, name = %created.name, "created endpoint");
        Ok(created)
    }

    /// Lists endpoints whose names start with `prefix`. An empty prefix
    /// matches every endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::List`] when the provider call fails.
    pub async fn list_endpoints(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Endpoint>, EndpointError<B::Error>> {
        let endpoints = cancellable(
            cancel,
            async {
                self.backend
                    .list_endpoints()
                    .await
                    .map_err(EndpointError::List)
            },
            || EndpointError::Cancelled,
        )
        .await?;
        Ok(endpoints
            .into_iter()
            .filter(|endpoint| endpoint.name.starts_with(prefix))
            .collect())
    }

    /// Looks up an endpoint by id.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::List`] when the provider call fails.
    pub async fn find_by_id(
        &self,
        endpoint_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Endpoint>, EndpointError<B::Error>> {
        Ok(self
            .list_endpoints("", cancel)
            .await?
            .into_iter()
            .find(|endpoint| endpoint.id == endpoint_id))
    }

    /// Deletes an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Delete`] when the provider call fails.
    pub async fn delete_endpoint(
        &self,
        endpoint_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EndpointError<B::Error>> {
        cancellable(
            cancel,
            async {
                self.backend
                    .delete_endpoint(endpoint_id)
                    .await
                    .map_err(|source| EndpointError::Delete {
                        endpoint_id: endpoint_id.to_owned(),
                        source,
                    })
            },
            || EndpointError::Cancelled,
        )
        .await?;
        info!(endpoint_id, "deleted endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCompute;
    use rstest::rstest;

    fn ffmpeg_spec() -> EndpointSpec {
        provision_spec("mediarelay", FFMPEG_MODEL, None, Vec::new(), 0)
            .unwrap_or_else(|err| panic!("spec should build: {err}"))
    }

    #[rstest]
    #[case("ffmpeg", "mediarelay-ffmpeg")]
    #[case("", "mediarelay-img-real-esrgan")]
    #[case("real-esrgan", "mediarelay-img-real-esrgan")]
    #[case("codeformer", "mediarelay-img-codeformer")]
    fn names_follow_model(#[case] model: &str, #[case] expected: &str) {
        assert_eq!(endpoint_name_for_model("mediarelay", model), expected);
    }

    #[test]
    fn unknown_model_has_no_template() {
        let err = provision_spec("mediarelay", "codeformer", None, Vec::new(), 0)
            .expect_err("no template for unknown models");
        assert!(matches!(err, BackendError::Validation(_)), "unexpected: {err:?}");
    }

    #[test]
    fn compute_class_override_narrows_list() {
        let spec = provision_spec(
            "mediarelay",
            DEFAULT_IMAGE_MODEL,
            Some("NVIDIA L4"),
            vec![String::from("EU-RO-1")],
            1,
        )
        .unwrap_or_else(|err| panic!("spec should build: {err}"));
        assert_eq!(spec.compute_classes, vec!["NVIDIA L4"]);
        assert_eq!(spec.template_id, REAL_ESRGAN_TEMPLATE_ID);
        assert_eq!(spec.workers_min, 1);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_for_a_prefix() {
        let compute = ScriptedCompute::new();
        let manager = EndpointManager::new(compute.clone());
        let spec = ffmpeg_spec();
        let cancel = CancellationToken::new();

        let first = manager
            .ensure_endpoint("mediarelay-ffmpeg", Some(&spec), &cancel)
            .await
            .unwrap_or_else(|err| panic!("first ensure: {err}"));
        let second = manager
            .ensure_endpoint("mediarelay-ffmpeg", Some(&spec), &cancel)
            .await
            .unwrap_or_else(|err| panic!("second ensure: {err}"));

        assert_eq!(first.id, second.id);
        assert_eq!(compute.endpoints().len(), 1);
        assert_eq!(
            compute
                .calls()
                .iter()
                .filter(|call| call.starts_with("create_endpoint"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn list_failure_falls_through_to_creation() {
        let compute = ScriptedCompute::new();
        compute.fail_next_lists(1);
        let manager = EndpointManager::new(compute.clone());

        let endpoint = manager
            .ensure_endpoint("mediarelay-ffmpeg", Some(&ffmpeg_spec()), &CancellationToken::new())
            .await
            .unwrap_or_else(|err| panic!("ensure should create: {err}"));
        assert_eq!(endpoint.name, "mediarelay-ffmpeg");
    }

    #[tokio::test]
    async fn missing_endpoint_without_spec_is_not_found() {
        let manager = EndpointManager::new(ScriptedCompute::new());
        let err = manager
            .ensure_endpoint("mediarelay-ffmpeg", None, &CancellationToken::new())
            .await
            .expect_err("nothing to return");
        assert!(matches!(err, EndpointError::NotFound { .. }), "unexpected: {err:?}");
    }

    #[tokio::test]
    async fn prefix_matching_reuses_family_member() {
        let compute = ScriptedCompute::new().with_endpoint(Endpoint {
            id: String::from("ep-existing"),
            name: String::from("mediarelay-img-real-esrgan-v2"),
            ..Endpoint::default()
        });
        let manager = EndpointManager::new(compute.clone());
        let found = manager
            .ensure_endpoint("mediarelay-img-real-esrgan", None, &CancellationToken::new())
            .await
            .unwrap_or_else(|err| panic!("prefix should match: {err}"));
        assert_eq!(found.id, "ep-existing");
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_listing() {
        let compute = ScriptedCompute::new();
        let manager = EndpointManager::new(compute.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .ensure_endpoint("mediarelay-ffmpeg", Some(&ffmpeg_spec()), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, EndpointError::Cancelled), "unexpected: {err:?}");
        assert!(compute.endpoints().is_empty());
    }
}
