//! Service directory: name-based discovery of running instances.
//!
//! Each service keeps its endpoint set as an immutable snapshot behind an
//! `ArcSwap`. Writers for one service serialize on that service's mutex and
//! publish a new snapshot; readers load the current snapshot without
//! locking. Writes to different services never contend.
//!
//! Controllers register an instance only once it is Running and deregister
//! it before it is marked Terminating, so every endpoint a reader can see
//! belongs to a live, ready instance. There is no cache: a write is visible
//! to the next resolve.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ork_id::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{InstanceAddress, Labels, Selector};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' has no running endpoints")]
    NoEndpoints(String),

    /// `resolve_all` on a service that exposes a single virtual address.
    #[error("service '{0}' is not headless")]
    NotHeadless(String),
}

/// Port mapping from the service port to the instance's target port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    pub target_port: u16,
}

/// Discovery entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub selector: Selector,
    pub headless: bool,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>, selector: Selector, headless: bool) -> Self {
        Self {
            name: name.into(),
            selector,
            headless,
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16, target_port: u16) -> Self {
        self.ports.push(ServicePort { port, target_port });
        self
    }

    /// Target port for endpoints; the first mapping is the primary one.
    fn target_port(&self, fallback: Option<u16>) -> u16 {
        self.ports
            .first()
            .map(|p| p.target_port)
            .or(fallback)
            .unwrap_or(0)
    }
}

/// One resolvable backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub instance_id: InstanceId,
    pub hostname: String,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(self.ip, self.port, 0, 0))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// What the directory remembers about a registered instance.
#[derive(Debug, Clone)]
struct Registration {
    labels: Labels,
    address: InstanceAddress,
    default_port: Option<u16>,
}

impl Registration {
    fn endpoint_for(&self, instance_id: InstanceId, entry: &ServiceEntry) -> Endpoint {
        Endpoint {
            instance_id,
            hostname: self.address.hostname.clone(),
            ip: self.address.ip,
            port: entry.target_port(self.default_port),
        }
    }
}

struct ServiceRecord {
    entry: ArcSwap<ServiceEntry>,
    endpoints: ArcSwap<Vec<Endpoint>>,
    writer: Mutex<()>,
    rr_counter: AtomicUsize,
}

impl ServiceRecord {
    fn new(entry: ServiceEntry) -> Self {
        Self {
            entry: ArcSwap::from_pointee(entry),
            endpoints: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
            rr_counter: AtomicUsize::new(0),
        }
    }
}

/// The service directory.
pub struct ServiceDirectory {
    services: ArcSwap<HashMap<String, Arc<ServiceRecord>>>,
    services_writer: Mutex<()>,
    registrations: Mutex<HashMap<InstanceId, Registration>>,
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDirectory")
            .field("services", &self.services.load().len())
            .finish()
    }
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self {
            services: ArcSwap::from_pointee(HashMap::new()),
            services_writer: Mutex::new(()),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Create or replace a service entry.
    ///
    /// Selectors are re-evaluated against every registered instance.
    pub async fn upsert_service(&self, entry: ServiceEntry) {
        let record = {
            let _guard = self.services_writer.lock().await;
            let current = self.services.load();
            match current.get(&entry.name) {
                Some(record) => {
                    record.entry.store(Arc::new(entry.clone()));
                    Arc::clone(record)
                }
                None => {
                    let record = Arc::new(ServiceRecord::new(entry.clone()));
                    let mut next = HashMap::clone(&current);
                    next.insert(entry.name.clone(), Arc::clone(&record));
                    self.services.store(Arc::new(next));
                    record
                }
            }
        };

        let _writer = record.writer.lock().await;
        let entry = record.entry.load_full();
        let registrations = self.registrations.lock().await;
        let mut endpoints: Vec<Endpoint> = registrations
            .iter()
            .filter(|(_, r)| entry.selector.matches(&r.labels))
            .map(|(id, r)| r.endpoint_for(*id, &entry))
            .collect();
        endpoints.sort_by_key(|e| e.instance_id);

        info!(
            service = %entry.name,
            headless = entry.headless,
            endpoints = endpoints.len(),
            "Service upserted"
        );
        record.endpoints.store(Arc::new(endpoints));
    }

    /// Remove a service entry. Returns true if it existed.
    pub async fn remove_service(&self, name: &str) -> bool {
        let _guard = self.services_writer.lock().await;
        let current = self.services.load();
        if !current.contains_key(name) {
            return false;
        }

        let mut next = HashMap::clone(&current);
        next.remove(name);
        self.services.store(Arc::new(next));
        info!(service = %name, "Service removed");
        true
    }

    pub fn service(&self, name: &str) -> Option<ServiceEntry> {
        self.services
            .load()
            .get(name)
            .map(|r| ServiceEntry::clone(&r.entry.load()))
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a running instance with every service whose selector matches.
    ///
    /// Returns the names of the services it was added to.
    pub async fn register(
        &self,
        instance_id: InstanceId,
        labels: &Labels,
        address: &InstanceAddress,
        default_port: Option<u16>,
    ) -> Vec<String> {
        let registration = Registration {
            labels: labels.clone(),
            address: address.clone(),
            default_port,
        };
        self.registrations
            .lock()
            .await
            .insert(instance_id, registration.clone());

        let services = self.services.load_full();
        let mut joined = Vec::new();
        for (name, record) in services.iter() {
            let _writer = record.writer.lock().await;
            let entry = record.entry.load();
            if !entry.selector.matches(labels) {
                continue;
            }

            let current = record.endpoints.load();
            let mut next: Vec<Endpoint> = current
                .iter()
                .filter(|e| e.instance_id != instance_id)
                .cloned()
                .collect();
            next.push(registration.endpoint_for(instance_id, &entry));
            next.sort_by_key(|e| e.instance_id);
            record.endpoints.store(Arc::new(next));
            joined.push(name.clone());
        }

        debug!(instance_id = %instance_id, services = ?joined, "Registered instance");
        joined
    }

    /// Remove an instance from every service. Idempotent.
    pub async fn deregister(&self, instance_id: &InstanceId) {
        self.registrations.lock().await.remove(instance_id);

        let services = self.services.load_full();
        for record in services.values() {
            let _writer = record.writer.lock().await;
            let current = record.endpoints.load();
            if !current.iter().any(|e| &e.instance_id == instance_id) {
                continue;
            }
            let next: Vec<Endpoint> = current
                .iter()
                .filter(|e| &e.instance_id != instance_id)
                .cloned()
                .collect();
            record.endpoints.store(Arc::new(next));
        }

        debug!(instance_id = %instance_id, "Deregistered instance");
    }

    /// Resolve a service to one endpoint, round-robin over registered endpoints.
    pub fn resolve(&self, name: &str) -> Result<Endpoint, DirectoryError> {
        let services = self.services.load();
        let record = services
            .get(name)
            .ok_or_else(|| DirectoryError::UnknownService(name.to_string()))?;

        let endpoints = record.endpoints.load();
        if endpoints.is_empty() {
            return Err(DirectoryError::NoEndpoints(name.to_string()));
        }

        let idx = record.rr_counter.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Ok(endpoints[idx].clone())
    }

    /// Every endpoint of a headless service.
    pub fn resolve_all(&self, name: &str) -> Result<Vec<Endpoint>, DirectoryError> {
        let services = self.services.load();
        let record = services
            .get(name)
            .ok_or_else(|| DirectoryError::UnknownService(name.to_string()))?;

        if !record.entry.load().headless {
            return Err(DirectoryError::NotHeadless(name.to_string()));
        }
        Ok(Vec::clone(&record.endpoints.load()))
    }

    /// Whether an instance is currently resolvable through any service.
    pub fn is_resolvable(&self, instance_id: &InstanceId) -> bool {
        self.services
            .load()
            .values()
            .any(|r| r.endpoints.load().iter().any(|e| &e.instance_id == instance_id))
    }
}
