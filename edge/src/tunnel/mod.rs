use std::{collections::HashMap, sync::Arc};

use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tokio::{runtime::Handle, sync::Mutex};

use crate::config::TunnelConfig;

use self::{
    error::{Result, TunnelError},
    instance::TunnelInstance,
    origin::OriginMeta,
};

pub mod error;
pub mod instance;
pub mod name;
pub mod origin;
pub mod pool;
pub mod port;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub addr: String,
    pub connections: usize,
}

/// Registry of active tunnels keyed by identifier.
///
/// The instance map, the claimed-port set and the name/port RNG live behind a
/// single lock; creation holds it across port probing and binding.
///
/// Tunnel tasks are spawned on the runtime the manager was built on, not on
/// the HTTP worker that happened to handle the creation request.
#[derive(Clone)]
pub struct TunnelManager {
    cfg: Arc<TunnelConfig>,
    registry: Arc<Mutex<Registry>>,
    runtime: Handle,
}

struct Registry {
    instances: HashMap<String, Arc<TunnelInstance>>,
    claimed_ports: HashMap<u16, String>,
    rng: StdRng,
}

impl Registry {
    fn deregister(&mut self, instance: &Arc<TunnelInstance>) {
        let registered = self
            .instances
            .get(instance.id())
            .map_or(false, |current| Arc::ptr_eq(current, instance));

        if registered {
            self.instances.remove(instance.id());
            self.claimed_ports.remove(&instance.port());
        }
    }
}

impl TunnelManager {
    pub fn new(cfg: TunnelConfig) -> Self {
        Self::with_rng(cfg, StdRng::from_entropy())
    }

    pub fn with_rng(cfg: TunnelConfig, rng: StdRng) -> Self {
        Self {
            cfg: Arc::new(cfg),
            registry: Arc::new(Mutex::new(Registry {
                instances: HashMap::new(),
                claimed_ports: HashMap::new(),
                rng,
            })),
            runtime: Handle::current(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.cfg
    }

    /// Creates a tunnel under exactly `id`.
    pub async fn create(&self, id: &str, origin: OriginMeta) -> Result<Arc<TunnelInstance>> {
        let mut registry = self.registry.lock().await;

        if registry.instances.contains_key(id) {
            return Err(TunnelError::AlreadyExists(id.to_string()));
        }

        self.create_locked(&mut registry, id.to_string(), origin)
            .await
    }

    /// Creates a tunnel under `requested` when it is a valid, free name, and
    /// under a freshly generated one otherwise. A name taken between the check
    /// and the creation is caught by `create` and regenerated.
    pub async fn create_unique(
        &self,
        requested: Option<&str>,
        origin: OriginMeta,
    ) -> Result<Arc<TunnelInstance>> {
        let requested = requested
            .map(str::to_ascii_lowercase)
            .filter(|id| name::is_valid(id));

        if let Some(id) = requested {
            match self.create(&id, origin.clone()).await {
                Err(TunnelError::AlreadyExists(_)) => {
                    debug!("tunnel name {id} is taken, generating one");
                }
                result => return result,
            }
        }

        loop {
            let id = name::generate(&mut self.registry.lock().await.rng);
            if self.exists(&id).await {
                continue;
            }

            match self.create(&id, origin.clone()).await {
                Err(TunnelError::AlreadyExists(_)) => continue,
                result => return result,
            }
        }
    }

    async fn create_locked(
        &self,
        registry: &mut Registry,
        id: String,
        origin: OriginMeta,
    ) -> Result<Arc<TunnelInstance>> {
        let limit = self.cfg.max_clients();
        if registry.instances.len() >= limit {
            return Err(TunnelError::CapacityExceeded { limit });
        }

        let port = port::allocate(
            self.cfg.min_port,
            self.cfg.max_port,
            &registry.claimed_ports,
            &mut registry.rng,
        )
        .await?;

        let instance = self
            .runtime
            .spawn(TunnelInstance::start(
                id.clone(),
                port,
                self.cfg.clone(),
                origin,
            ))
            .await??;

        registry.claimed_ports.insert(port, id.clone());
        registry.instances.insert(id.clone(), instance.clone());

        let closed = instance.subscribe_on_close();
        let weak_registry = Arc::downgrade(&self.registry);
        let watched = instance.clone();
        self.runtime.spawn(async move {
            let _ = closed.await;

            if let Some(registry) = weak_registry.upgrade() {
                registry.lock().await.deregister(&watched);
                debug!("tunnel {} deregistered", watched.id());
            }
        });

        info!(
            "opened tunnel {id} on port {port} -> {} (creator {:?})",
            instance.url(),
            instance.origin().ip()
        );

        Ok(instance)
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.registry.lock().await.instances.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TunnelInstance>> {
        self.registry.lock().await.instances.get(id).cloned()
    }

    pub async fn running(&self) -> usize {
        self.registry.lock().await.instances.len()
    }

    pub async fn connections_stats(&self) -> Vec<ConnectionStats> {
        let registry = self.registry.lock().await;

        registry
            .instances
            .values()
            .map(|instance| ConnectionStats {
                addr: instance.addr().to_string(),
                connections: instance.connections(),
            })
            .collect()
    }

    /// Closes every tunnel and waits until each has been torn down.
    pub async fn close_all(&self) {
        let instances: Vec<_> = {
            let registry = self.registry.lock().await;
            registry.instances.values().cloned().collect()
        };

        for instance in instances {
            let closed = instance.subscribe_on_close();
            instance.request_close();
            let _ = closed.await;
        }
    }
}

/// A port range that was free a moment ago, so concurrently running tests
/// do not fight over tunnel ports.
#[cfg(test)]
pub(crate) async fn free_port_range(len: u16) -> (u16, u16) {
    use tokio::net::TcpListener;

    loop {
        let probe = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let start = probe.local_addr().unwrap().port();
        drop(probe);

        if start.checked_add(len).is_none() {
            continue;
        }

        let mut free = true;
        for port in start..start + len {
            if TcpListener::bind(("0.0.0.0", port)).await.is_err() {
                free = false;
                break;
            }
        }

        if free {
            return (start, start + len);
        }
    }
}
