use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::transport::Transport;
use crate::device::types::{ConnectionState, PeripheralHandle, StateCell};
use crate::error::ScanError;

/// Discovers nearby peripherals. At most one scan runs at a time; the scan
/// occupies the radio, so the shared connection state is `Scanning` for the
/// session's lifetime.
pub struct DeviceScanner<T: Transport> {
    transport: Arc<T>,
    state: StateCell,
}

impl<T: Transport> DeviceScanner<T> {
    pub fn new(transport: Arc<T>, state: StateCell) -> Self {
        DeviceScanner { transport, state }
    }

    /// Starts a scan session emitting each matching peripheral at most once.
    /// The session keeps emitting until stopped or dropped; stopping after
    /// the first match is the caller's choice.
    pub async fn scan<P>(&self, predicate: P) -> Result<ScanSession, ScanError>
    where
        P: Fn(&PeripheralHandle) -> bool + Send + 'static,
    {
        self.state
            .transition(&[ConnectionState::Idle], ConnectionState::Scanning)
            .map_err(|_| ScanError::AlreadyActive)?;

        let discovered = match self.transport.start_scan().await {
            Ok(discovered) => discovered,
            Err(source) => {
                self.state
                    .transition(&[ConnectionState::Scanning], ConnectionState::Idle)
                    .ok();
                return Err(ScanError::Transport { source });
            }
        };

        // The janitor is the only place that stops the radio scan, so the
        // release happens exactly once no matter how the session ends.
        let cancel = CancellationToken::new();
        let janitor = {
            let transport = Arc::clone(&self.transport);
            let state = self.state.clone();
            let cancel = cancel.clone();

            spawn(async move {
                cancel.cancelled().await;
                if let Err(err) = transport.stop_scan().await {
                    warn!("Failed to stop the Bluetooth scan: {}", err);
                }
                state
                    .transition(&[ConnectionState::Scanning], ConnectionState::Idle)
                    .ok();
            })
        };

        info!("Scanning for peripherals...");
        Ok(ScanSession {
            discovered,
            predicate: Box::new(predicate),
            seen: HashSet::new(),
            cancel,
            janitor: Some(janitor),
        })
    }
}

/// A running scan. Pull matches with `next`; the underlying radio scan is
/// released when the session is stopped or dropped.
pub struct ScanSession {
    discovered: BoxStream<'static, PeripheralHandle>,
    predicate: Box<dyn Fn(&PeripheralHandle) -> bool + Send>,
    seen: HashSet<String>,
    cancel: CancellationToken,
    janitor: Option<JoinHandle<()>>,
}

impl ScanSession {
    /// The next peripheral satisfying the predicate, deduplicated by
    /// identity within this session. `None` once the session is cancelled
    /// or the transport ends the discovery stream.
    pub async fn next(&mut self) -> Option<PeripheralHandle> {
        loop {
            let candidate = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                candidate = self.discovered.next() => candidate?,
            };

            if !self.seen.insert(candidate.id.clone()) {
                continue;
            }
            if (self.predicate)(&candidate) {
                info!(
                    "Found matching peripheral {} ({})",
                    candidate.name.as_deref().unwrap_or("unnamed"),
                    candidate.id,
                );
                return Some(candidate);
            }
        }
    }

    /// Stops the scan and waits until the radio has been released.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(janitor) = self.janitor.take() {
            let _ = janitor.await;
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use tokio::time::{sleep, Duration};

    use super::*;
    use crate::device::transport::mock::MockTransport;

    fn handle(id: &str, name: &str) -> PeripheralHandle {
        PeripheralHandle {
            id: id.to_string(),
            name: Some(name.to_string()),
        }
    }

    #[tokio::test]
    async fn emits_matches_once_and_filters_by_predicate() {
        let transport = MockTransport::new();
        transport.advertise(handle("aa:bb", "ESP32 HeartRate"));
        transport.advertise(handle("cc:dd", "Some Speaker"));
        transport.advertise(handle("aa:bb", "ESP32 HeartRate"));
        transport.advertise(handle("ee:ff", "ESP32 HeartRate"));

        let scanner = DeviceScanner::new(Arc::clone(&transport), StateCell::new());
        let mut session = scanner
            .scan(|peripheral| peripheral.name.as_deref() == Some("ESP32 HeartRate"))
            .await
            .unwrap();

        assert_eq!(session.next().await.unwrap().id, "aa:bb");
        assert_eq!(session.next().await.unwrap().id, "ee:ff");
        session.stop().await;
    }

    #[tokio::test]
    async fn second_scan_is_rejected_while_active() {
        let transport = MockTransport::new();
        let state = StateCell::new();
        let scanner = DeviceScanner::new(Arc::clone(&transport), state.clone());

        let session = scanner.scan(|_| true).await.unwrap();
        assert!(matches!(
            scanner.scan(|_| true).await,
            Err(ScanError::AlreadyActive)
        ));

        session.stop().await;
        assert_eq!(state.get(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn stop_releases_the_radio_exactly_once() {
        let transport = MockTransport::new();
        transport.advertise(handle("aa:bb", "ESP32 HeartRate"));

        let state = StateCell::new();
        let scanner = DeviceScanner::new(Arc::clone(&transport), state.clone());
        let mut session = scanner.scan(|_| true).await.unwrap();

        // cancellation racing a pending advertisement still releases once
        transport.advertise(handle("cc:dd", "Late Device"));
        session.next().await.unwrap();
        session.stop().await;

        assert_eq!(transport.stop_scan_calls.load(Ordering::Acquire), 1);
        assert_eq!(state.get(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn dropping_the_session_releases_the_radio() {
        let transport = MockTransport::new();
        let state = StateCell::new();
        let scanner = DeviceScanner::new(Arc::clone(&transport), state.clone());

        let session = scanner.scan(|_| true).await.unwrap();
        drop(session);

        for _ in 0..50 {
            if transport.stop_scan_calls.load(Ordering::Acquire) == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.stop_scan_calls.load(Ordering::Acquire), 1);
        assert_eq!(state.get(), ConnectionState::Idle);
    }
}
