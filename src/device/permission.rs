use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::device::transport::Transport;
use crate::error::PermissionError;

/// Gate in front of the radio: scanning may only start after one successful
/// `ensure_authorized`. A grant is cached, so repeated calls return without
/// prompting again.
pub struct PermissionGate<T: Transport> {
    transport: Arc<T>,
    granted: AtomicBool,
}

impl<T: Transport> PermissionGate<T> {
    pub fn new(transport: Arc<T>) -> Self {
        PermissionGate {
            transport,
            granted: AtomicBool::new(false),
        }
    }

    pub async fn ensure_authorized(&self) -> Result<(), PermissionError> {
        if self.granted.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.transport.request_permission().await {
            Ok(true) => {
                info!("Bluetooth use authorized");
                self.granted.store(true, Ordering::Release);
                Ok(())
            }
            Ok(false) => Err(PermissionError::Denied),
            Err(err) => {
                warn!("Could not determine Bluetooth permission: {}", err);
                Err(PermissionError::Denied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::device::transport::mock::MockTransport;

    #[tokio::test]
    async fn denial_is_surfaced() {
        let transport = MockTransport::new();
        transport.permission.store(false, Ordering::Release);

        let gate = PermissionGate::new(Arc::clone(&transport));
        assert!(gate.ensure_authorized().await.is_err());
    }

    #[tokio::test]
    async fn grant_is_cached() {
        let transport = MockTransport::new();
        let gate = PermissionGate::new(Arc::clone(&transport));

        gate.ensure_authorized().await.unwrap();

        // a later platform-side revocation is not re-queried once granted
        transport.permission.store(false, Ordering::Release);
        gate.ensure_authorized().await.unwrap();
    }
}
