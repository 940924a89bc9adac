//! Master Controller
//!
//! Validates CreateVolume parameters, picks the target nodes and forwards the
//! request to their node controllers through the registry. A node that is
//! not registered makes the call fail right away; retrying is up to the
//! caller.
//!
//! The master keeps no persistent state. Its view of which volume lives on
//! which node is rebuilt from the node controllers whenever they register.

use super::volume_id_for;
use crate::api::types::{CreateVolumeRequest, NodeCreateVolumeRequest, VolumeInfo};
use crate::client::NodeControllerClient;
use crate::error::{Error, Result};
use crate::parameters::{self, Origin, Persistency, Volume, VolumeContext, VOLUME_ID};
use crate::registry::{Registry, RegistryEvent};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A volume as tracked by the master
#[derive(Debug, Clone)]
struct MasterVolume {
    name: String,
    size: u64,
    context: VolumeContext,
    nodes: Vec<String>,
}

impl MasterVolume {
    fn info(&self, volume_id: &str) -> VolumeInfo {
        VolumeInfo {
            volume_id: volume_id.to_string(),
            capacity_bytes: self.size,
            volume_context: self.context.clone(),
            nodes: self.nodes.clone(),
        }
    }
}

/// Central controller routing volume operations to node controllers
pub struct MasterController {
    registry: Arc<Registry>,
    /// Bound for dialing a node controller
    connect_timeout: Duration,
    volumes: RwLock<HashMap<String, MasterVolume>>,
    /// One lock per volume ID
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MasterController {
    pub fn new(registry: Arc<Registry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            connect_timeout,
            volumes: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
        }
    }

    fn lock(&self, volume_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn node_client(&self, node_id: &str) -> Result<NodeControllerClient> {
        let connection = self
            .registry
            .connect_to_node_controller(node_id, self.connect_timeout)
            .await?;
        Ok(NodeControllerClient::new(connection))
    }

    /// Create a volume on the preferred nodes.
    ///
    /// Cache volumes get one device on each of the first `cacheSize` nodes.
    /// Without a preference the registered nodes are used in ID order.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<VolumeInfo> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("Volume name missing in request".into()));
        }
        if request.capacity_bytes == 0 {
            return Err(Error::InvalidArgument("Volume size missing in request".into()));
        }
        let volume = parameters::parse(Origin::CreateVolume, &request.parameters)?;
        let volume_id = volume_id_for(&request.name);

        let lock = self.lock(&volume_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.volumes.read().get(&volume_id) {
            if existing.size == request.capacity_bytes {
                debug!("Volume {} exists already", volume_id);
                return Ok(existing.info(&volume_id));
            }
            return Err(Error::VolumeExists {
                name: request.name.clone(),
            });
        }

        let wanted = match volume.persistency() {
            Persistency::Cache => volume.cache_size() as usize,
            _ => 1,
        };
        let candidates = if request.preferred_nodes.is_empty() {
            self.registry
                .nodes()
                .into_iter()
                .map(|n| n.node_id)
                .collect()
        } else {
            request.preferred_nodes.clone()
        };
        if candidates.len() < wanted {
            return Err(Error::InvalidArgument(format!(
                "volume needs {} nodes, only {} available",
                wanted,
                candidates.len()
            )));
        }

        let mut node_parameters = request.parameters.clone();
        node_parameters.insert(VOLUME_ID.to_string(), volume_id.clone());
        let node_request = NodeCreateVolumeRequest {
            name: request.name.clone(),
            capacity_bytes: request.capacity_bytes,
            parameters: node_parameters,
        };

        let mut nodes = Vec::with_capacity(wanted);
        let mut size = request.capacity_bytes;
        for node_id in candidates.iter().take(wanted) {
            let created = match self.node_client(node_id).await {
                Ok(client) => client.create_volume(&node_request).await,
                Err(e) => Err(e),
            };
            match created {
                Ok(reply) => {
                    debug!("Volume {} created on node {}", volume_id, node_id);
                    size = size.max(reply.capacity_bytes);
                    nodes.push(node_id.clone());
                }
                Err(e) => {
                    warn!("Failed to create volume {} on node {}: {}", volume_id, node_id, e);
                    self.rollback(&volume_id, &nodes).await;
                    return Err(e);
                }
            }
        }

        let context = Volume {
            name: Some(request.name.clone()),
            ..volume
        }
        .to_context();
        let record = MasterVolume {
            name: request.name.clone(),
            size,
            context,
            nodes,
        };
        let info = record.info(&volume_id);
        self.volumes.write().insert(volume_id.clone(), record);
        info!("Created volume {} on nodes {:?}", volume_id, info.nodes);
        Ok(info)
    }

    async fn rollback(&self, volume_id: &str, nodes: &[String]) {
        let deletions = nodes.iter().map(|node_id| async move {
            let deleted = match self.node_client(node_id).await {
                Ok(client) => client.delete_volume(volume_id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                warn!(
                    "Failed to remove partially created volume {} from node {}: {}",
                    volume_id, node_id, e
                );
            }
        });
        join_all(deletions).await;
    }

    /// Delete a volume from all of its nodes; unknown IDs succeed
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::InvalidArgument("Volume ID missing in request".into()));
        }

        let lock = self.lock(volume_id);
        let _guard = lock.lock().await;

        let Some((name, nodes)) = self
            .volumes
            .read()
            .get(volume_id)
            .map(|v| (v.name.clone(), v.nodes.clone()))
        else {
            debug!("Volume {} not known, nothing to delete", volume_id);
            return Ok(());
        };

        for node_id in &nodes {
            let client = self.node_client(node_id).await?;
            client.delete_volume(volume_id).await?;
            debug!("Volume {} deleted on node {}", volume_id, node_id);

            // Forget finished nodes so that a retry only contacts the rest
            if let Some(volume) = self.volumes.write().get_mut(volume_id) {
                volume.nodes.retain(|n| n != node_id);
            }
        }

        self.volumes.write().remove(volume_id);
        info!("Deleted volume {} ({}) from nodes {:?}", volume_id, name, nodes);
        Ok(())
    }

    /// All known volumes, ordered by ID
    pub fn list_volumes(&self) -> Vec<VolumeInfo> {
        let mut volumes: Vec<VolumeInfo> = self
            .volumes
            .read()
            .iter()
            .map(|(id, v)| v.info(id))
            .collect();
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        volumes
    }

    /// Capacity reported by the node controller of `node_id`
    pub async fn node_capacity(&self, node_id: &str) -> Result<u64> {
        self.node_client(node_id).await?.get_capacity().await
    }

    /// Merge the volumes of a (re-)registered node into the volume map
    pub async fn on_node_added(&self, node_id: &str) -> Result<()> {
        let volumes = self.node_client(node_id).await?.list_volumes().await?;
        let mut known = self.volumes.write();
        for volume in &volumes {
            let node_volume = match parameters::parse(Origin::NodeVolume, &volume.volume_context) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        "Ignoring volume {} of node {}: {}",
                        volume.volume_id, node_id, e
                    );
                    continue;
                }
            };
            let record = known
                .entry(volume.volume_id.clone())
                .or_insert_with(|| MasterVolume {
                    name: node_volume.name().to_string(),
                    size: volume.capacity_bytes,
                    context: Volume {
                        size: None,
                        ..node_volume.clone()
                    }
                    .to_context(),
                    nodes: Vec::new(),
                });
            if !record.nodes.iter().any(|n| n == node_id) {
                record.nodes.push(node_id.to_string());
            }
        }
        info!("Node {} holds {} volumes", node_id, volumes.len());
        Ok(())
    }

    /// Follow registry events until `token` is cancelled
    pub fn spawn_event_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let master = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(RegistryEvent::ControllerRegistered { node_id, .. }) => {
                        if let Err(e) = master.on_node_added(&node_id).await {
                            warn!("Failed to fetch volumes of node {}: {}", node_id, e);
                        }
                    }
                    Ok(RegistryEvent::ControllerUnregistered { node_id }) => {
                        debug!("Node {} left, keeping its volumes", node_id);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} registry events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rest::{router, ApiState};
    use crate::controller::{FileState, NodeController};
    use crate::device::FakeDeviceManager;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct TestNode {
        _tmp: TempDir,
        addr: String,
        controller: Arc<NodeController>,
    }

    async fn spawn_node(node_id: &str, capacity: u64) -> TestNode {
        let tmp = TempDir::new().unwrap();
        let state = FileState::new(tmp.path()).await.unwrap();
        let dm = Arc::new(FakeDeviceManager::new(capacity));
        let controller = Arc::new(NodeController::new(node_id, dm, state).await.unwrap());

        let app = router(ApiState {
            node: Some(controller.clone()),
            ..Default::default()
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestNode {
            _tmp: tmp,
            addr,
            controller,
        }
    }

    fn request(name: &str, size: u64, params: &[(&str, &str)], nodes: &[&str]) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_bytes: size,
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            preferred_nodes: nodes.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn master(registry: &Arc<Registry>) -> MasterController {
        MasterController::new(registry.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_create_routes_to_preferred_node() {
        let node1 = spawn_node("node-1", 4 * GIB).await;
        let node2 = spawn_node("node-2", 4 * GIB).await;
        let registry = Arc::new(Registry::default());
        registry.register_controller("node-1", &node1.addr).unwrap();
        registry.register_controller("node-2", &node2.addr).unwrap();
        let master = master(&registry);

        let info = master
            .create_volume(&request("pvc-1", GIB, &[], &["node-2", "node-1"]))
            .await
            .unwrap();
        assert_eq!(info.nodes, vec!["node-2"]);
        assert_eq!(info.volume_id, volume_id_for("pvc-1"));
        assert_eq!(info.volume_context.get("name").unwrap(), "pvc-1");
        // the context must be valid for the publish call
        parameters::parse(Origin::PersistentVolume, &info.volume_context).unwrap();

        assert_eq!(node2.controller.list_volumes().len(), 1);
        assert!(node1.controller.list_volumes().is_empty());
        assert_eq!(master.node_capacity("node-2").await.unwrap(), 3 * GIB);

        // same request again
        let again = master
            .create_volume(&request("pvc-1", GIB, &[], &["node-1"]))
            .await
            .unwrap();
        assert_eq!(again, info);
        assert_matches!(
            master
                .create_volume(&request("pvc-1", 2 * GIB, &[], &["node-1"]))
                .await,
            Err(Error::VolumeExists { .. })
        );

        master.delete_volume(&info.volume_id).await.unwrap();
        assert!(node2.controller.list_volumes().is_empty());
        assert!(master.list_volumes().is_empty());
        master.delete_volume(&info.volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_volume_on_several_nodes() {
        let node1 = spawn_node("node-1", 4 * GIB).await;
        let node2 = spawn_node("node-2", 4 * GIB).await;
        let registry = Arc::new(Registry::default());
        registry.register_controller("node-1", &node1.addr).unwrap();
        registry.register_controller("node-2", &node2.addr).unwrap();
        let master = master(&registry);

        let params = [("persistencyModel", "cache"), ("cacheSize", "2")];
        let info = master
            .create_volume(&request("cache-1", GIB, &params, &[]))
            .await
            .unwrap();
        assert_eq!(info.nodes, vec!["node-1", "node-2"]);
        assert_eq!(node1.controller.list_volumes().len(), 1);
        assert_eq!(node2.controller.list_volumes().len(), 1);

        assert_matches!(
            master
                .create_volume(&request(
                    "cache-2",
                    GIB,
                    &[("persistencyModel", "cache"), ("cacheSize", "3")],
                    &[]
                ))
                .await,
            Err(Error::InvalidArgument(_))
        );

        master.delete_volume(&info.volume_id).await.unwrap();
        assert!(node1.controller.list_volumes().is_empty());
        assert!(node2.controller.list_volumes().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_node_fails_immediately() {
        let registry = Arc::new(Registry::default());
        let master = master(&registry);
        assert_matches!(
            master
                .create_volume(&request("pvc-1", GIB, &[], &["node-9"]))
                .await,
            Err(Error::NodeNotFound { .. })
        );
        assert_matches!(
            master.node_capacity("node-9").await,
            Err(Error::NodeNotFound { .. })
        );
        assert!(master.list_volumes().is_empty());
    }

    #[tokio::test]
    async fn test_create_validates_parameters() {
        let registry = Arc::new(Registry::default());
        let master = master(&registry);
        assert_matches!(
            master
                .create_volume(&request("pvc-1", GIB, &[("_id", "x")], &["node-1"]))
                .await,
            Err(Error::ParameterNotAllowed { .. })
        );
        assert_matches!(
            master
                .create_volume(&request("pvc-1", GIB, &[("cacheSize", "2")], &["node-1"]))
                .await,
            Err(Error::ParameterConflict { .. })
        );
        assert_matches!(
            master.create_volume(&request("pvc-1", 0, &[], &["node-1"])).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_failed_cache_volume_is_rolled_back() {
        let node1 = spawn_node("node-1", 4 * GIB).await;
        let node2 = spawn_node("node-2", GIB / 2).await;
        let registry = Arc::new(Registry::default());
        registry.register_controller("node-1", &node1.addr).unwrap();
        registry.register_controller("node-2", &node2.addr).unwrap();
        let master = master(&registry);

        let params = [("persistencyModel", "cache"), ("cacheSize", "2")];
        let err = master
            .create_volume(&request("cache-1", GIB, &params, &["node-1", "node-2"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ResourceExhausted);
        assert!(node1.controller.list_volumes().is_empty());
        assert!(master.list_volumes().is_empty());
    }

    #[tokio::test]
    async fn test_volumes_rebuilt_on_registration() {
        let node1 = spawn_node("node-1", 4 * GIB).await;
        let registry = Arc::new(Registry::default());
        registry.register_controller("node-1", &node1.addr).unwrap();
        let info = master(&registry)
            .create_volume(&request("pvc-1", GIB, &[("eraseafter", "false")], &["node-1"]))
            .await
            .unwrap();

        // a fresh master learns about the volume when the node registers
        let registry = Arc::new(Registry::default());
        let master = Arc::new(master(&registry));
        let token = CancellationToken::new();
        let events = master.spawn_event_loop(token.clone());
        registry.register_controller("node-1", &node1.addr).unwrap();

        for _ in 0..200 {
            if !master.list_volumes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let volumes = master.list_volumes();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].volume_id, info.volume_id);
        assert_eq!(volumes[0].nodes, vec!["node-1"]);
        assert_eq!(volumes[0].volume_context, info.volume_context);

        master.delete_volume(&info.volume_id).await.unwrap();
        assert!(node1.controller.list_volumes().is_empty());

        token.cancel();
        events.await.unwrap();
    }
}
