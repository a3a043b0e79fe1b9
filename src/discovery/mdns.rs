//! Production [`DiscoveryBackend`] built on `mdns-sd`, mirroring the
//! advertise/browse model used by the original implementation's
//! `hashicorp/mdns`-backed finder: one registered service record plus a
//! periodic, time-bounded browse.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::debug;

use crate::error::DiscoveryError;

use super::{BrowseEntry, DiscoveryBackend, LocalService, SERVICE_TYPE};

/// How long a single browse call waits for answers before returning
/// whatever it collected. Matches the discovery engine's query interval so
/// one browse roughly corresponds to one query cycle.
const BROWSE_WINDOW: Duration = Duration::from_secs(10);

pub struct MdnsBackend {
    daemon: ServiceDaemon,
    registered_fullname: Mutex<Option<String>>,
}

impl MdnsBackend {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        Ok(Self { daemon, registered_fullname: Mutex::new(None) })
    }
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    async fn advertise(&self, service: &LocalService) -> Result<(), DiscoveryError> {
        let host_name = format!("{}.local.", service.device_name);
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &service.device_name,
            &host_name,
            service.ip,
            service.port,
            None,
        )
        .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        let fullname = info.get_fullname().to_string();
        self.daemon.register(info).map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        *self.registered_fullname.lock().expect("mutex poisoned") = Some(fullname);
        Ok(())
    }

    async fn browse(&self) -> Result<Vec<BrowseEntry>, DiscoveryError> {
        let receiver =
            self.daemon.browse(SERVICE_TYPE).map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        let entries = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let deadline = std::time::Instant::now() + BROWSE_WINDOW;
            while let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            {
                match receiver.recv_timeout(remaining) {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let peer_id = info
                            .get_hostname()
                            .split('.')
                            .next()
                            .unwrap_or_default()
                            .to_string();
                        if let Some(ip) = info.get_addresses().iter().next() {
                            found.push(BrowseEntry { peer_id, ip: *ip, port: info.get_port() });
                        }
                    }
                    Ok(_other) => continue,
                    Err(_timeout_or_disconnect) => break,
                }
            }
            found
        })
        .await
        .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;

        debug!(count = entries.len(), "mdns browse cycle complete");
        Ok(entries)
    }

    async fn stop_advertising(&self) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.registered_fullname.lock().expect("mutex poisoned").take() {
            let _ = self.daemon.unregister(&fullname);
        }
        Ok(())
    }
}
