//! Per-task network management.
//!
//! Ensures host L2/L3 plumbing (bridge, NAT) and gives each task attachment
//! its own TAP device with a deterministic address. Records are keyed by
//! `(task_id, if_name)` under a mutex; locks are never held across the host
//! tool invocations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use scorch_networking::IpAllocator;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{IpMode, NetworkSettings};
use crate::task::{annotations, Task};

use super::bridge;
use super::tap::{self, TapRecord};
use super::{tap_device_name, NetError};

/// Network capability the executor composes.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Plumb every attachment of the task; annotates the task with the TAP
    /// names and assigned addresses.
    async fn prepare_network(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<(), NetError>;

    /// Release every network resource held for the task. Continues past
    /// individual failures and reports them aggregated.
    async fn cleanup_network(&self, task: &Task) -> Result<(), NetError>;
}

/// Production manager backed by the host bridge and `ip`/`iptables`.
pub struct BridgeNetworkManager {
    settings: NetworkSettings,
    allocator: Mutex<IpAllocator>,
    records: Mutex<HashMap<(String, String), TapRecord>>,
    /// Fast path only; the host link table stays authoritative.
    bridges_ready: Mutex<HashSet<String>>,
    nat_ready: AtomicBool,
}

impl BridgeNetworkManager {
    pub fn new(settings: NetworkSettings) -> Result<Self, NetError> {
        let allocator = IpAllocator::new(settings.subnet, settings.bridge_ip)?;
        Ok(Self {
            settings,
            allocator: Mutex::new(allocator),
            records: Mutex::new(HashMap::new()),
            bridges_ready: Mutex::new(HashSet::new()),
            nat_ready: AtomicBool::new(false),
        })
    }

    /// Allocator key for an attachment: the task id itself for the first
    /// interface, suffixed for the rare multi-homed task.
    fn alloc_key(task_id: &str, index: usize) -> String {
        if index == 0 {
            task_id.to_string()
        } else {
            format!("{task_id}/eth{index}")
        }
    }

    async fn ensure_bridge_once(&self, bridge_name: &str) -> Result<(), NetError> {
        {
            let ready = self.bridges_ready.lock().await;
            if ready.contains(bridge_name) {
                return Ok(());
            }
        }

        bridge::ensure_bridge(bridge_name, self.settings.bridge_ip, self.settings.subnet).await?;

        self.bridges_ready
            .lock()
            .await
            .insert(bridge_name.to_string());
        Ok(())
    }

    async fn ensure_nat_once(&self, bridge_name: &str) -> Result<(), NetError> {
        if !self.settings.nat_enabled || self.nat_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        // ensure_nat itself checks before adding, so a racing double call is
        // harmless.
        bridge::ensure_nat(&self.settings.subnet, bridge_name).await?;
        self.nat_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for BridgeNetworkManager {
    async fn prepare_network(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<(), NetError> {
        let task_id = task.task_id.clone();
        let attachments = task.networks.clone();

        for (idx, attachment) in attachments.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(NetError::Cancelled);
            }

            let bridge_name = if attachment.bridge.is_empty() {
                self.settings.bridge_name.clone()
            } else {
                attachment.bridge.clone()
            };

            self.ensure_bridge_once(&bridge_name).await?;
            self.ensure_nat_once(&bridge_name).await?;

            let if_name = tap_device_name(&task_id, idx);

            // A stale device from a crashed predecessor gets replaced.
            if tap::tap_exists(&if_name) {
                warn!(tap = %if_name, "Replacing stale TAP device");
                if let Err(e) = tap::delete_tap(&if_name).await {
                    warn!(tap = %if_name, error = %e, "Failed to delete stale TAP");
                }
            }

            tap::create_tap(&if_name).await?;
            tap::attach_to_bridge(&if_name, &bridge_name).await?;

            let mut record = TapRecord {
                task_id: task_id.clone(),
                if_name: if_name.clone(),
                bridge: bridge_name,
                iface_index: idx,
                address: None,
                prefix_len: self.settings.subnet.prefix_len(),
                gateway: None,
                subnet: None,
            };

            if self.settings.ip_mode == IpMode::Static {
                let key = Self::alloc_key(&task_id, idx);
                let address = {
                    let mut allocator = self.allocator.lock().await;
                    match attachment.static_addresses.first() {
                        Some(requested) => {
                            let parsed = requested.parse().map_err(|_| {
                                NetError::InvalidStaticAddress(requested.clone())
                            })?;
                            allocator.claim(&key, parsed)?
                        }
                        None => allocator.allocate(&key)?,
                    }
                };

                record.address = Some(address);
                record.gateway = Some(self.settings.bridge_ip);
                record.subnet = Some(self.settings.subnet);

                task.set_annotation(
                    annotations::net_ip(&record.iface_id()),
                    format!("{}/{}", address, record.prefix_len),
                );
            }

            task.set_annotation(annotations::net_tap(&record.iface_id()), if_name.clone());

            info!(
                task_id = %task_id,
                tap = %if_name,
                bridge = %record.bridge,
                address = ?record.address,
                "Network prepared"
            );

            self.records
                .lock()
                .await
                .insert((task_id.clone(), if_name), record);
        }

        Ok(())
    }

    async fn cleanup_network(&self, task: &Task) -> Result<(), NetError> {
        let task_id = &task.task_id;

        let taken: Vec<TapRecord> = {
            let mut records = self.records.lock().await;
            let keys: Vec<(String, String)> = records
                .keys()
                .filter(|(tid, _)| tid == task_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| records.remove(&k)).collect()
        };

        let mut errors = Vec::new();
        for record in taken {
            if tap::tap_exists(&record.if_name) {
                if let Err(e) = tap::delete_tap(&record.if_name).await {
                    errors.push(format!("{}: {e}", record.if_name));
                }
            }

            if record.address.is_some() {
                let key = Self::alloc_key(task_id, record.iface_index);
                self.allocator.lock().await.release(&key);
            }

            info!(task_id = %task_id, tap = %record.if_name, "Network released");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetError::CleanupPartial { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NetworkAttachment, Resources, RuntimeSpec};

    fn settings() -> NetworkSettings {
        NetworkSettings::default()
    }

    fn task_with_networks(task_id: &str, count: usize) -> Task {
        Task {
            task_id: task_id.to_string(),
            service_id: "svc".to_string(),
            node_id: "n".to_string(),
            runtime: RuntimeSpec {
                kind: "container".to_string(),
                image: "alpine:3".to_string(),
                command: vec![],
                args: vec![],
                env: Default::default(),
                mounts: vec![],
            },
            resources: Resources::default(),
            networks: (0..count)
                .map(|_| NetworkAttachment {
                    bridge: String::new(),
                    static_addresses: vec![],
                })
                .collect(),
            annotations: Default::default(),
        }
    }

    #[test]
    fn test_alloc_key_scheme() {
        assert_eq!(BridgeNetworkManager::alloc_key("t1", 0), "t1");
        assert_eq!(BridgeNetworkManager::alloc_key("t1", 1), "t1/eth1");
    }

    #[test]
    fn test_new_rejects_gateway_outside_subnet() {
        let mut bad = settings();
        bad.bridge_ip = "10.9.9.9".parse().unwrap();
        assert!(BridgeNetworkManager::new(bad).is_err());
    }

    #[tokio::test]
    async fn test_prepare_zero_attachments_touches_nothing() {
        let manager = BridgeNetworkManager::new(settings()).unwrap();
        let mut task = task_with_networks("t1", 0);
        let cancel = CancellationToken::new();

        manager.prepare_network(&mut task, &cancel).await.unwrap();
        assert!(task.annotations.is_empty());
        assert!(manager.records.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_respects_cancellation() {
        let manager = BridgeNetworkManager::new(settings()).unwrap();
        let mut task = task_with_networks("t1", 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            manager.prepare_network(&mut task, &cancel).await,
            Err(NetError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_without_records_is_success() {
        let manager = BridgeNetworkManager::new(settings()).unwrap();
        let task = task_with_networks("t1", 1);
        manager.cleanup_network(&task).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_releases_allocations_for_records() {
        let manager = BridgeNetworkManager::new(settings()).unwrap();
        let task = task_with_networks("t1", 1);

        // Seed a record whose TAP never existed on the host; cleanup must
        // still release the address and drop the record.
        let address = manager.allocator.lock().await.allocate("t1").unwrap();
        manager.records.lock().await.insert(
            ("t1".to_string(), "tap-dead-eth0".to_string()),
            TapRecord {
                task_id: "t1".to_string(),
                if_name: "tap-dead-eth0".to_string(),
                bridge: "scorch0".to_string(),
                iface_index: 0,
                address: Some(address),
                prefix_len: 24,
                gateway: Some(settings().bridge_ip),
                subnet: Some(settings().subnet),
            },
        );

        manager.cleanup_network(&task).await.unwrap();
        assert!(manager.records.lock().await.is_empty());
        assert_eq!(manager.allocator.lock().await.lookup("t1"), None);
    }
}
