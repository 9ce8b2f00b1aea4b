//! Network volume abstractions for staging media next to remote workers.

use crate::backend::{BackendError, BackendFuture, ComputeBackend};

/// Smallest volume the provider will create, in GB.
pub const MIN_VOLUME_SIZE_GB: u32 = 10;

/// Parameters required to create a network volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Human-friendly volume name.
    pub name: String,
    /// Size in GB.
    pub size_gb: u32,
    /// Data centre that will host the volume.
    pub data_center_id: String,
}

impl VolumeRequest {
    /// Creates a new volume request, trimming string fields.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::VolumeTooSmall`] below
    /// [`MIN_VOLUME_SIZE_GB`], and [`BackendError::Validation`] for an empty
    /// name or data centre.
    pub fn new(
        name: impl Into<String>,
        size_gb: u32,
        data_center_id: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let request = Self {
            name: name.into().trim().to_owned(),
            size_gb,
            data_center_id: data_center_id.into().trim().to_owned(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Re-checks the request; backends call this before calling out.
    ///
    /// # Errors
    ///
    /// See [`VolumeRequest::new`].
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.size_gb < MIN_VOLUME_SIZE_GB {
            return Err(BackendError::VolumeTooSmall {
                requested: self.size_gb,
                minimum: MIN_VOLUME_SIZE_GB,
            });
        }
        if self.name.is_empty() {
            return Err(BackendError::Validation("name".to_owned()));
        }
        if self.data_center_id.is_empty() {
            return Err(BackendError::Validation("data_center_id".to_owned()));
        }
        Ok(())
    }
}

/// A remote persistent storage resource.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkVolume {
    /// Provider identifier; doubles as the object-store bucket name.
    pub id: String,
    /// Human-friendly name.
    pub name: String,
    /// Size in GB.
    pub size_gb: u32,
    /// Data centre hosting the volume. The object-store endpoint is derived
    /// from it.
    pub data_center_id: String,
    /// Provider status string, when reported.
    pub status: Option<String>,
}

/// Backend operations required for volume management.
pub trait VolumeBackend: ComputeBackend {
    /// Lists every volume owned by the credential.
    fn list_volumes(&self) -> BackendFuture<'_, Vec<NetworkVolume>, Self::Error>;

    /// Fetches one volume.
    fn get_volume<'a>(&'a self, volume_id: &'a str)
    -> BackendFuture<'a, NetworkVolume, Self::Error>;

    /// Creates a new volume.
    fn create_volume<'a>(
        &'a self,
        request: &'a VolumeRequest,
    ) -> BackendFuture<'a, NetworkVolume, Self::Error>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(9)]
    fn rejects_undersized_volumes(#[case] size_gb: u32) {
        let err = VolumeRequest::new("vol", size_gb, "EU-RO-1").expect_err("too small");
        assert_eq!(
            err,
            BackendError::VolumeTooSmall {
                requested: size_gb,
                minimum: MIN_VOLUME_SIZE_GB
            }
        );
    }

    #[test]
    fn accepts_minimum_size_and_trims() {
        let request = VolumeRequest::new(" vol ", MIN_VOLUME_SIZE_GB, " EU-RO-1 ")
            .unwrap_or_else(|err| panic!("request should be valid: {err}"));
        assert_eq!(request.name, "vol");
        assert_eq!(request.data_center_id, "EU-RO-1");
    }
}
