use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::device::{DeviceMapping, Slot};
use crate::link::{self, LinkHandle};
use crate::router::Router;

/// How long a worker gets to acknowledge a close request before replacement
/// gives up on it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Worker {
    slot: Slot,
    handle: LinkHandle,
    join: JoinHandle<()>,
}

/// Owns the link workers for the current device mapping.
///
/// One worker per mapping entry; replacing the mapping stops every old
/// worker before any new one starts, so two workers never hold the same
/// port path.
pub struct ConnectionSupervisor {
    router: Router,
    log_dir: PathBuf,
    workers: Mutex<Vec<Worker>>,
}

impl ConnectionSupervisor {
    /// A supervisor with no workers yet.
    pub fn new(router: Router, log_dir: PathBuf) -> Self {
        Self {
            router,
            log_dir,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a worker per mapping entry and register each with the router.
    pub async fn connect_all(&self, mapping: &DeviceMapping) {
        let mut workers = self.workers.lock().await;

        for entry in &mapping.devices {
            let slot = entry.id;
            let (handle, join) = link::spawn(entry.clone(), self.router.clone(), &self.log_dir);

            self.router.register_device(slot, handle.clone()).await;
            workers.push(Worker { slot, handle, join });
        }

        info!(workers = workers.len(), "Device links up");
    }

    /// Swap the worker set over to a new mapping.
    ///
    /// Every old worker is told to close and must acknowledge (task exit,
    /// port released) before the new set starts; clients keep their
    /// connections but re-resolve routing against the new mapping. In-flight
    /// writes to old workers are not drained.
    pub async fn replace(&self, mapping: &DeviceMapping) {
        {
            let mut workers = self.workers.lock().await;

            for worker in workers.iter() {
                worker.handle.close();
            }

            for worker in workers.drain(..) {
                let abort = worker.join.abort_handle();

                match tokio::time::timeout(SHUTDOWN_GRACE, worker.join).await {
                    Ok(_) => {}
                    Err(_) => {
                        // A worker stuck past the grace period should not
                        // happen; kill it so it cannot keep the port, log
                        // it, and move on.
                        error!(
                            slot = %worker.slot,
                            "Link worker did not acknowledge shutdown within {SHUTDOWN_GRACE:?}"
                        );
                        abort.abort();
                    }
                }

                self.router.unregister_device(worker.slot).await;
            }
        }

        self.connect_all(mapping).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionProperties, DeviceEntry};
    use crate::error::Error;
    use crate::router::WriteKind;

    fn entry(number: u16, port: &str) -> DeviceEntry {
        DeviceEntry {
            id: Slot::new(number, 0).unwrap(),
            device_type: "DTA".into(),
            connection_properties: ConnectionProperties::new(port),
        }
    }

    fn mapping(entries: &[(u16, &str)]) -> DeviceMapping {
        DeviceMapping {
            devices: entries
                .iter()
                .map(|(number, port)| entry(*number, port))
                .collect(),
            device_type: None,
        }
    }

    fn test_log_dir() -> PathBuf {
        std::env::temp_dir().join(format!("slotline-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test(start_paused = true)]
    async fn replace_swaps_the_worker_set() {
        let router = Router::new();
        let supervisor = ConnectionSupervisor::new(router.clone(), test_log_dir());

        let slot = |n| Slot::new(n, 0).unwrap();

        supervisor
            .connect_all(&mapping(&[(1, "/dev/ttyO-sup-test-0"), (2, "/dev/ttyO-sup-test-1")]))
            .await;

        assert!(router.link(slot(1)).await.is_some());
        assert!(router.link(slot(2)).await.is_some());

        supervisor
            .replace(&mapping(&[(2, "/dev/ttyO-sup-test-1"), (3, "/dev/ttyO-sup-test-2")]))
            .await;

        // Slot 1 is no longer a valid device target.
        assert!(matches!(
            router.route_to_device(slot(1), b"hi", WriteKind::Text).await,
            Err(Error::UnknownSlot(_))
        ));

        // Slots 2 and 3 have live workers.
        assert!(router.link(slot(2)).await.is_some());
        assert!(router.link(slot(3)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn replace_stops_old_workers_before_starting_new_ones() {
        let router = Router::new();
        let supervisor = ConnectionSupervisor::new(router.clone(), test_log_dir());

        supervisor.connect_all(&mapping(&[(1, "/dev/ttyO-sup-test-0")])).await;
        let old = router.link(Slot::new(1, 0).unwrap()).await.unwrap();

        supervisor.replace(&mapping(&[(1, "/dev/ttyO-sup-test-0")])).await;
        let new = router.link(Slot::new(1, 0).unwrap()).await.unwrap();

        // The old handle's worker is gone: writes through it bounce.
        assert!(old.send_text("hi").is_err());
        assert!(new.send_text("hi").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn replace_with_empty_mapping_leaves_no_workers() {
        let router = Router::new();
        let supervisor = ConnectionSupervisor::new(router.clone(), test_log_dir());

        supervisor
            .connect_all(&mapping(&[(1, "/dev/ttyO-sup-test-0"), (2, "/dev/ttyO-sup-test-1")]))
            .await;
        supervisor.replace(&DeviceMapping::default()).await;

        assert!(router.links().await.is_empty());
    }
}
