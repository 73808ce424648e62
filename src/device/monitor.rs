use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{info, warn};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::connection::ConnectionManager;
use crate::device::constants::{ERROR_CHANNEL_CAPACITY, LINK_POLL_DELAY, SAMPLE_CHANNEL_CAPACITY};
use crate::device::decode::decode_measurement;
use crate::device::transport::Transport;
use crate::device::types::{ConnectionState, HeartRateSample, PeripheralHandle, ServiceDescriptor, StateCell};
use crate::error::{MonitorError, ProtocolError};

/// A running subscription to the heart rate measurement characteristic.
/// Decoded samples and per-notification protocol errors arrive on separate
/// channels; both close when the session ends, by `stop`, by the peripheral
/// disconnecting, or by the transport ending the notification stream.
pub struct MonitorSession {
    pub samples: mpsc::Receiver<HeartRateSample>,
    pub errors: mpsc::Receiver<ProtocolError>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorSession {
    /// Subscribes on a `Ready` connection and starts the decode loop.
    pub async fn start<T: Transport>(
        manager: &ConnectionManager<T>,
        descriptor: ServiceDescriptor,
    ) -> Result<MonitorSession, MonitorError> {
        manager
            .state_cell()
            .transition(&[ConnectionState::Ready], ConnectionState::Monitoring)
            .map_err(|current| match current {
                ConnectionState::Monitoring => MonitorError::AlreadyActive,
                other => MonitorError::InvalidStateTransition(other),
            })?;

        let Some(handle) = manager.current_handle() else {
            let current = manager
                .state_cell()
                .force(ConnectionState::Disconnected);
            return Err(MonitorError::InvalidStateTransition(current));
        };

        let notifications = match manager.transport().subscribe(&handle, &descriptor).await {
            Ok(notifications) => notifications,
            Err(source) => {
                // the link itself is still usable, only the subscription failed
                manager
                    .state_cell()
                    .transition(&[ConnectionState::Monitoring], ConnectionState::Ready)
                    .ok();
                return Err(MonitorError::Subscribe { source });
            }
        };

        info!("Monitoring heart rate notifications");

        let (sample_tx, samples) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();

        let task = spawn(monitor_loop(
            Arc::clone(manager.transport()),
            manager.state_cell().clone(),
            handle,
            descriptor,
            notifications,
            sample_tx,
            error_tx,
            stop.clone(),
            manager.disconnected(),
        ));

        Ok(MonitorSession {
            samples,
            errors,
            stop,
            task: Some(task),
        })
    }

    /// Tears the subscription down and waits for the decode loop to finish.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_loop<T: Transport>(
    transport: Arc<T>,
    state: StateCell,
    handle: PeripheralHandle,
    descriptor: ServiceDescriptor,
    mut notifications: BoxStream<'static, Vec<u8>>,
    sample_tx: mpsc::Sender<HeartRateSample>,
    error_tx: mpsc::Sender<ProtocolError>,
    stop: CancellationToken,
    disconnected: CancellationToken,
) {
    let mut seq: u64 = 0;
    let mut stream_ended = false;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = disconnected.cancelled() => break,
            notification = notifications.next() => {
                let Some(raw) = notification else {
                    stream_ended = true;
                    break;
                };

                match decode_measurement(&raw) {
                    Ok(bpm) => {
                        seq += 1;
                        let sample = HeartRateSample { bpm, seq };
                        if sample_tx.send(sample).await.is_err() {
                            // the caller dropped the sample stream: stop
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("Skipping malformed notification: {}", err);
                        let _ = error_tx.send(err).await;
                    }
                }
            }
        }
    }

    // Teardown runs once, at loop exit. A stream that ended on its own has
    // usually done so because the link dropped; give the disconnect
    // notification a moment to confirm before treating it as a local stop.
    let mut remote = disconnected.is_cancelled();
    if stream_ended && !remote {
        remote = tokio::select! {
            _ = disconnected.cancelled() => true,
            _ = sleep(Duration::from_millis(LINK_POLL_DELAY)) => false,
        };
    }

    if !remote {
        if let Err(err) = transport.unsubscribe(&handle, &descriptor).await {
            warn!("Failed to unsubscribe from the measurement characteristic: {}", err);
        }
        state
            .transition(&[ConnectionState::Monitoring], ConnectionState::Ready)
            .ok();
    }

    info!("Monitor session ended");
    // dropping the senders closes both streams
}
