//! Endpoint and deploy directory.
//!
//! The invoker only needs three lookups, captured by [`EndpointDirectory`]:
//! which deploy is active for an endpoint, the artifact bytes of a deploy,
//! and switching the active deploy. [`InMemoryDirectory`] implements it along
//! with the control-plane operations (create, list, deploy, rollback, delete)
//! used by the admin API and the CLI.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use edge_gateway_common::{DeployId, EndpointId, GatewayError, Runtime};

/// What the invoker needs to know about an endpoint at resolve time.
///
/// A snapshot is taken once per invocation and used for its whole lifetime,
/// so a concurrent rollback never changes the deploy mid-flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    /// The endpoint.
    pub endpoint_id: EndpointId,
    /// Deploy active when the snapshot was taken.
    pub active_deploy_id: DeployId,
    /// Guest runtime of the endpoint.
    pub runtime: Runtime,
    /// Environment injected into the guest.
    pub environment: BTreeMap<String, String>,
}

/// Lookup and storage operations the invoker depends on.
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Resolve an endpoint to its active deploy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::EndpointNotFound`] when the endpoint does not
    /// exist or has nothing deployed.
    async fn resolve_active_deploy(
        &self,
        endpoint_id: &EndpointId,
    ) -> Result<EndpointSnapshot, GatewayError>;

    /// Fetch the raw artifact of a deploy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeployNotFound`] for an unknown deploy.
    async fn get_deploy_artifact(&self, deploy_id: &DeployId) -> Result<Bytes, GatewayError>;

    /// Make `deploy_id` the active deploy of `endpoint_id`.
    ///
    /// # Errors
    ///
    /// Fails if either id is unknown or the deploy belongs to another
    /// endpoint.
    async fn set_active_deploy(
        &self,
        endpoint_id: &EndpointId,
        deploy_id: &DeployId,
    ) -> Result<(), GatewayError>;
}

/// An externally addressable function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub runtime: Runtime,
    pub environment: BTreeMap<String, String>,
    pub active_deploy_id: Option<DeployId>,
    /// Every deploy ever made to this endpoint, oldest first.
    pub deploy_history: Vec<DeployId>,
    pub created_at: u64,
}

/// One immutable uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    pub id: DeployId,
    pub endpoint_id: EndpointId,
    pub size_bytes: usize,
    pub created_at: u64,
}

/// Parameters for [`InMemoryDirectory::create_endpoint`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewEndpoint {
    /// Explicit identifier; a random one is generated when absent.
    #[serde(default)]
    pub id: Option<EndpointId>,
    pub name: String,
    pub runtime: Runtime,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Default)]
struct DirectoryState {
    endpoints: HashMap<EndpointId, Endpoint>,
    deploys: HashMap<DeployId, (Deploy, Bytes)>,
}

/// Process-local endpoint directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint with no deploy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for an empty name or a
    /// duplicate id.
    pub fn create_endpoint(&self, params: NewEndpoint) -> Result<Endpoint, GatewayError> {
        if params.name.trim().is_empty() {
            return Err(GatewayError::invalid_request("Endpoint name must not be empty"));
        }

        let id = params.id.unwrap_or_else(EndpointId::generate);
        let mut state = self.state.write();
        if state.endpoints.contains_key(&id) {
            return Err(GatewayError::invalid_request(format!(
                "Endpoint {id} already exists"
            )));
        }

        let endpoint = Endpoint {
            id: id.clone(),
            name: params.name,
            runtime: params.runtime,
            environment: params.environment,
            active_deploy_id: None,
            deploy_history: Vec::new(),
            created_at: unix_now(),
        };
        state.endpoints.insert(id, endpoint.clone());

        info!(endpoint_id = %endpoint.id, name = %endpoint.name, runtime = %endpoint.runtime, "Endpoint created");
        Ok(endpoint)
    }

    /// All endpoints, ordered by name.
    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.state.read().endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        endpoints
    }

    /// Look up one endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::EndpointNotFound`] for an unknown id.
    pub fn get_endpoint(&self, endpoint_id: &EndpointId) -> Result<Endpoint, GatewayError> {
        self.state
            .read()
            .endpoints
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| GatewayError::endpoint_not_found(endpoint_id.as_str()))
    }

    /// Store a new artifact for an endpoint and make it active.
    ///
    /// # Errors
    ///
    /// Fails for an unknown endpoint or an empty artifact.
    pub fn create_deploy(
        &self,
        endpoint_id: &EndpointId,
        artifact: Bytes,
    ) -> Result<Deploy, GatewayError> {
        if artifact.is_empty() {
            return Err(GatewayError::invalid_request("Deploy artifact is empty"));
        }

        let mut state = self.state.write();
        let endpoint = state
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| GatewayError::endpoint_not_found(endpoint_id.as_str()))?;

        let deploy = Deploy {
            id: DeployId::generate(),
            endpoint_id: endpoint_id.clone(),
            size_bytes: artifact.len(),
            created_at: unix_now(),
        };
        endpoint.deploy_history.push(deploy.id.clone());
        endpoint.active_deploy_id = Some(deploy.id.clone());

        state
            .deploys
            .insert(deploy.id.clone(), (deploy.clone(), artifact));

        info!(
            endpoint_id = %endpoint_id,
            deploy_id = %deploy.id,
            size_bytes = deploy.size_bytes,
            "Deploy created"
        );
        Ok(deploy)
    }

    /// Point an endpoint back at an earlier deploy from its history.
    ///
    /// # Errors
    ///
    /// Fails if the deploy is unknown or not part of this endpoint's history.
    pub fn rollback(
        &self,
        endpoint_id: &EndpointId,
        deploy_id: &DeployId,
    ) -> Result<Endpoint, GatewayError> {
        let mut state = self.state.write();

        if !state.deploys.contains_key(deploy_id) {
            return Err(GatewayError::deploy_not_found(deploy_id.as_str()));
        }

        let endpoint = state
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| GatewayError::endpoint_not_found(endpoint_id.as_str()))?;

        if !endpoint.deploy_history.contains(deploy_id) {
            return Err(GatewayError::invalid_request(format!(
                "Deploy {deploy_id} does not belong to endpoint {endpoint_id}"
            )));
        }

        let previous = endpoint.active_deploy_id.replace(deploy_id.clone());
        info!(
            endpoint_id = %endpoint_id,
            deploy_id = %deploy_id,
            previous = ?previous.as_ref().map(DeployId::as_str),
            "Active deploy changed"
        );

        Ok(endpoint.clone())
    }

    /// Delete a deploy's artifact. The active deploy cannot be deleted.
    ///
    /// The caller is responsible for evicting the compiled module.
    ///
    /// # Errors
    ///
    /// Fails for an unknown deploy or one that is currently active.
    pub fn delete_deploy(&self, deploy_id: &DeployId) -> Result<Deploy, GatewayError> {
        let mut state = self.state.write();

        let endpoint_id = state
            .deploys
            .get(deploy_id)
            .map(|(deploy, _)| deploy.endpoint_id.clone())
            .ok_or_else(|| GatewayError::deploy_not_found(deploy_id.as_str()))?;

        if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
            if endpoint.active_deploy_id.as_ref() == Some(deploy_id) {
                return Err(GatewayError::invalid_request(format!(
                    "Deploy {deploy_id} is active on endpoint {endpoint_id}"
                )));
            }
            endpoint.deploy_history.retain(|id| id != deploy_id);
        }

        let (deploy, _) = state
            .deploys
            .remove(deploy_id)
            .ok_or_else(|| GatewayError::deploy_not_found(deploy_id.as_str()))?;

        info!(deploy_id = %deploy_id, endpoint_id = %endpoint_id, "Deploy deleted");
        Ok(deploy)
    }
}

#[async_trait]
impl EndpointDirectory for InMemoryDirectory {
    async fn resolve_active_deploy(
        &self,
        endpoint_id: &EndpointId,
    ) -> Result<EndpointSnapshot, GatewayError> {
        let state = self.state.read();
        let endpoint = state
            .endpoints
            .get(endpoint_id)
            .ok_or_else(|| GatewayError::endpoint_not_found(endpoint_id.as_str()))?;
        let active_deploy_id = endpoint
            .active_deploy_id
            .clone()
            .ok_or_else(|| GatewayError::endpoint_not_found(endpoint_id.as_str()))?;

        Ok(EndpointSnapshot {
            endpoint_id: endpoint.id.clone(),
            active_deploy_id,
            runtime: endpoint.runtime,
            environment: endpoint.environment.clone(),
        })
    }

    async fn get_deploy_artifact(&self, deploy_id: &DeployId) -> Result<Bytes, GatewayError> {
        self.state
            .read()
            .deploys
            .get(deploy_id)
            .map(|(_, artifact)| artifact.clone())
            .ok_or_else(|| GatewayError::deploy_not_found(deploy_id.as_str()))
    }

    async fn set_active_deploy(
        &self,
        endpoint_id: &EndpointId,
        deploy_id: &DeployId,
    ) -> Result<(), GatewayError> {
        self.rollback(endpoint_id, deploy_id).map(|_| ())
    }
}

impl std::fmt::Debug for InMemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryDirectory")
            .field("endpoints", &state.endpoints.len())
            .field("deploys", &state.deploys.len())
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_endpoint(name: &str) -> NewEndpoint {
        NewEndpoint {
            id: Some(EndpointId::new(name)),
            name: name.to_string(),
            runtime: Runtime::Go,
            environment: BTreeMap::from([("KEY".to_string(), "value".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let dir = InMemoryDirectory::new();
        let endpoint = dir.create_endpoint(new_endpoint("hello")).unwrap();
        assert!(endpoint.active_deploy_id.is_none());

        // Nothing deployed yet
        let err = dir.resolve_active_deploy(&endpoint.id).await.unwrap_err();
        assert!(err.is_not_found());

        let deploy = dir
            .create_deploy(&endpoint.id, Bytes::from_static(b"\0asm"))
            .unwrap();
        let snapshot = dir.resolve_active_deploy(&endpoint.id).await.unwrap();

        assert_eq!(snapshot.active_deploy_id, deploy.id);
        assert_eq!(snapshot.runtime, Runtime::Go);
        assert_eq!(snapshot.environment["KEY"], "value");
        assert_eq!(
            dir.get_deploy_artifact(&deploy.id).await.unwrap(),
            Bytes::from_static(b"\0asm")
        );
    }

    #[test]
    fn test_create_endpoint_validation() {
        let dir = InMemoryDirectory::new();
        dir.create_endpoint(new_endpoint("a")).unwrap();

        assert!(dir.create_endpoint(new_endpoint("a")).is_err());
        assert!(dir.create_endpoint(new_endpoint(" ")).is_err());

        let generated = dir
            .create_endpoint(NewEndpoint {
                id: None,
                ..new_endpoint("b")
            })
            .unwrap();
        assert_ne!(generated.id.as_str(), "b");
    }

    #[test]
    fn test_list_endpoints_sorted() {
        let dir = InMemoryDirectory::new();
        dir.create_endpoint(new_endpoint("zeta")).unwrap();
        dir.create_endpoint(new_endpoint("alpha")).unwrap();

        let names: Vec<String> = dir.list_endpoints().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_rollback_keeps_history() {
        let dir = InMemoryDirectory::new();
        let endpoint = dir.create_endpoint(new_endpoint("e")).unwrap();
        let first = dir.create_deploy(&endpoint.id, Bytes::from_static(b"v1")).unwrap();
        let second = dir.create_deploy(&endpoint.id, Bytes::from_static(b"v2")).unwrap();

        let rolled = dir.rollback(&endpoint.id, &first.id).unwrap();
        assert_eq!(rolled.active_deploy_id, Some(first.id.clone()));
        assert_eq!(rolled.deploy_history, [first.id.clone(), second.id.clone()]);

        dir.set_active_deploy(&endpoint.id, &second.id).await.unwrap();
        let snapshot = dir.resolve_active_deploy(&endpoint.id).await.unwrap();
        assert_eq!(snapshot.active_deploy_id, second.id);
    }

    #[test]
    fn test_rollback_rejects_foreign_deploy() {
        let dir = InMemoryDirectory::new();
        let a = dir.create_endpoint(new_endpoint("a")).unwrap();
        let b = dir.create_endpoint(new_endpoint("b")).unwrap();
        let deploy_b = dir.create_deploy(&b.id, Bytes::from_static(b"b")).unwrap();

        let err = dir.rollback(&a.id, &deploy_b.id).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));

        let err = dir.rollback(&a.id, &DeployId::new("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_deploy() {
        let dir = InMemoryDirectory::new();
        let endpoint = dir.create_endpoint(new_endpoint("e")).unwrap();
        let old = dir.create_deploy(&endpoint.id, Bytes::from_static(b"v1")).unwrap();
        let active = dir.create_deploy(&endpoint.id, Bytes::from_static(b"v2")).unwrap();

        assert!(dir.delete_deploy(&active.id).is_err());

        dir.delete_deploy(&old.id).unwrap();
        assert_eq!(
            dir.get_endpoint(&endpoint.id).unwrap().deploy_history,
            [active.id]
        );
        assert!(dir.delete_deploy(&old.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_artifact_rejected() {
        let dir = InMemoryDirectory::new();
        let endpoint = dir.create_endpoint(new_endpoint("e")).unwrap();
        assert!(dir.create_deploy(&endpoint.id, Bytes::new()).is_err());
    }
}
