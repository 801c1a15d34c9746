//! The template produced by a successful build.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::backend::{Backend, VmRef};
use crate::state::GeneratedData;

/// Identifies artifacts produced by this builder.
pub const BUILDER_ID: &str = "kiln.proxmox-ct";

/// Handle to a finished template.
///
/// The artifact keeps the backend so callers can destroy the template
/// without rebuilding a client.
pub struct Artifact<B> {
    template: VmRef,
    backend: Arc<B>,
    generated_data: GeneratedData,
}

impl<B: Backend> Artifact<B> {
    /// Wraps a template reference.
    #[must_use]
    pub const fn new(template: VmRef, backend: Arc<B>, generated_data: GeneratedData) -> Self {
        Self {
            template,
            backend,
            generated_data,
        }
    }

    /// Returns [`BUILDER_ID`].
    #[must_use]
    pub const fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// Returns the template identifier in decimal.
    #[must_use]
    pub fn id(&self) -> String {
        self.template.id.to_string()
    }

    /// Returns the template reference.
    #[must_use]
    pub const fn template(&self) -> &VmRef {
        &self.template
    }

    /// Templates live on the hypervisor; there are no local files.
    #[must_use]
    pub const fn files(&self) -> &[String] {
        &[]
    }

    /// Looks up a generated-data entry. `"generated_data"` returns the
    /// whole bag as an object.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<serde_json::Value> {
        if name == "generated_data" {
            let bag = self
                .generated_data
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            return Some(serde_json::Value::Object(bag));
        }
        self.generated_data.get(name).cloned()
    }

    /// Deletes the template.
    ///
    /// # Errors
    ///
    /// Returns the backend error unchanged.
    pub async fn destroy(&self) -> Result<(), B::Error> {
        info!(vmid = %self.template.id, node = %self.template.node, "destroying template");
        self.backend.delete(&self.template).await?;
        Ok(())
    }
}

impl<B> fmt::Display for Artifact<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A template was created: {}", self.template.id)
    }
}

impl<B> fmt::Debug for Artifact<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("template", &self.template)
            .field("generated_data", &self.generated_data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;
    use crate::backend::VmId;
    use crate::test_support::{BackendCall, ScriptedBackend, ScriptedBackendError};

    #[fixture]
    fn backend() -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend::new())
    }

    fn artifact(backend: &Arc<ScriptedBackend>) -> Artifact<ScriptedBackend> {
        let mut data = GeneratedData::new();
        data.insert(String::from("VmId"), json!(123));
        data.insert(String::from("Node"), json!("pve1"));
        Artifact::new(VmRef::new(VmId::new(123), "pve1"), Arc::clone(backend), data)
    }

    #[rstest]
    fn describes_the_template(backend: Arc<ScriptedBackend>) {
        let artifact = artifact(&backend);
        assert_eq!(artifact.id(), "123");
        assert_eq!(artifact.builder_id(), "kiln.proxmox-ct");
        assert!(artifact.files().is_empty());
        assert_eq!(artifact.to_string(), "A template was created: 123");
    }

    #[rstest]
    fn exposes_generated_data(backend: Arc<ScriptedBackend>) {
        let artifact = artifact(&backend);
        assert_eq!(artifact.state("Node"), Some(json!("pve1")));
        assert_eq!(artifact.state("ContainerIp"), None);
        assert_eq!(
            artifact.state("generated_data"),
            Some(json!({ "Node": "pve1", "VmId": 123 }))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn destroy_deletes_the_template(backend: Arc<ScriptedBackend>) {
        let artifact = artifact(&backend);
        artifact
            .destroy()
            .await
            .unwrap_or_else(|err| panic!("destroy failed: {err}"));
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Delete(VmRef::new(VmId::new(123), "pve1"))]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn destroy_surfaces_backend_errors(backend: Arc<ScriptedBackend>) {
        backend.push_delete(Err(ScriptedBackendError::Failed(String::from("locked"))));
        let err = artifact(&backend)
            .destroy()
            .await
            .expect_err("delete failure should surface");
        assert_eq!(err, ScriptedBackendError::Failed(String::from("locked")));
    }
}
