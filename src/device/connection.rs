use std::sync::{Arc, Mutex};

use futures::StreamExt;
use log::{info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::CONNECT_DEADLINE;
use crate::device::transport::Transport;
use crate::device::types::{ConnectionState, PeripheralHandle, StateCell};
use crate::error::{ConnectError, DiscoveryError, TransportError};

struct ActiveLink {
    handle: PeripheralHandle,
    // cancelled exactly once per connection lifetime, local or remote
    token: CancellationToken,
    watcher: JoinHandle<()>,
}

/// Owns the single peripheral connection and its lifecycle state. Every
/// transition goes through the shared state cell, so concurrent calls
/// serialize there and out-of-order calls are rejected, never queued.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    state: StateCell,
    link: Mutex<Option<ActiveLink>>,
    connect_deadline: Duration,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_state(transport, StateCell::new())
    }

    /// Shares the state cell with a scanner so that the radio is used by a
    /// scan or a connection, never both.
    pub fn with_state(transport: Arc<T>, state: StateCell) -> Self {
        ConnectionManager {
            transport,
            state,
            link: Mutex::new(None),
            connect_deadline: Duration::from_millis(CONNECT_DEADLINE),
        }
    }

    pub fn set_connect_deadline(&mut self, deadline: Duration) {
        self.connect_deadline = deadline;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub(crate) fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub(crate) fn current_handle(&self) -> Option<PeripheralHandle> {
        self.link
            .lock()
            .expect("connection link lock poisoned")
            .as_ref()
            .map(|link| link.handle.clone())
    }

    /// A token cancelled when this connection ends, locally or remotely.
    /// Already cancelled when no connection is established.
    pub fn disconnected(&self) -> CancellationToken {
        let link = self.link.lock().expect("connection link lock poisoned");
        match link.as_ref() {
            Some(link) => link.token.child_token(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Establishes the transport-level link, taking ownership of the handle.
    /// On success the state is `DiscoveringServices`: the link is up and
    /// `discover_services` is the required next step.
    pub async fn connect(&self, handle: PeripheralHandle) -> Result<(), ConnectError> {
        self.state
            .transition(
                &[ConnectionState::Idle, ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .map_err(|_| ConnectError::AlreadyConnected)?;

        info!(
            "Connecting to peripheral {} ({})...",
            handle.name.as_deref().unwrap_or("unnamed"),
            handle.id,
        );

        let attempt = tokio::select! {
            _ = sleep(self.connect_deadline) => None,
            result = self.transport.connect(&handle) => Some(result),
        };

        match attempt {
            None => {
                // deadline hit; release whatever was half-established
                let _ = self.transport.disconnect(&handle).await;
                self.state.force(ConnectionState::Disconnected);
                return Err(ConnectError::Timeout);
            }
            Some(Err(source)) => {
                self.state.force(ConnectionState::Disconnected);
                return Err(ConnectError::Rejected { source });
            }
            Some(Ok(())) => {}
        }

        let token = CancellationToken::new();
        let watcher = match self.spawn_disconnect_watcher(&handle, token.clone()).await {
            Ok(watcher) => watcher,
            Err(source) => {
                let _ = self.transport.disconnect(&handle).await;
                self.state.force(ConnectionState::Disconnected);
                return Err(ConnectError::Rejected { source });
            }
        };

        *self.link.lock().expect("connection link lock poisoned") = Some(ActiveLink {
            handle: handle.clone(),
            token: token.clone(),
            watcher,
        });

        if self
            .state
            .transition(&[ConnectionState::Connecting], ConnectionState::DiscoveringServices)
            .is_err()
        {
            // a disconnect won the race against the completing connect
            self.link.lock().expect("connection link lock poisoned").take();
            token.cancel();
            let _ = self.transport.disconnect(&handle).await;
            self.state.force(ConnectionState::Disconnected);
            return Err(ConnectError::Rejected {
                source: TransportError::LinkClosed,
            });
        }

        info!("Connected");
        Ok(())
    }

    /// Enumerates services and characteristics on the live link. Required
    /// before a monitor session may subscribe; a characteristic obtained
    /// without discovery is invalid on most transports.
    pub async fn discover_services(&self) -> Result<(), DiscoveryError> {
        let current = self.state.get();
        if current != ConnectionState::DiscoveringServices {
            return Err(DiscoveryError::InvalidStateTransition(current));
        }

        let Some(handle) = self.current_handle() else {
            return Err(DiscoveryError::InvalidStateTransition(current));
        };

        info!("Discovering peripheral services...");
        match self.transport.discover_services(&handle).await {
            Ok(()) => {
                self.state
                    .transition(&[ConnectionState::DiscoveringServices], ConnectionState::Ready)
                    .map_err(DiscoveryError::InvalidStateTransition)?;
                info!("Peripheral ready");
                Ok(())
            }
            Err(source) => {
                // a half-discovered connection is not usable; tear it down
                self.disconnect().await;
                Err(DiscoveryError::Failed { source })
            }
        }
    }

    /// Releases the link. Safe to call from any state and idempotent once
    /// disconnected.
    pub async fn disconnect(&self) {
        let link = {
            let mut link = self.link.lock().expect("connection link lock poisoned");
            link.take()
        };

        let Some(link) = link else {
            return;
        };

        if link.token.is_cancelled() {
            // a remote disconnect already tore this link down
            return;
        }

        self.state.force(ConnectionState::Disconnecting);
        link.token.cancel();

        if let Err(err) = self.transport.disconnect(&link.handle).await {
            warn!("Failed to release the Bluetooth link: {}", err);
        }

        self.state.force(ConnectionState::Disconnected);
        info!("Disconnected from peripheral {}", link.handle.id);
        drop(link.watcher);
    }

    async fn spawn_disconnect_watcher(
        &self,
        handle: &PeripheralHandle,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, TransportError> {
        let mut events = self.transport.disconnect_events(handle).await?;
        let state = self.state.clone();
        let id = handle.id.clone();

        Ok(spawn(async move {
            tokio::select! {
                // a local disconnect cancels the token first; stand down
                _ = token.cancelled() => {}
                event = events.next() => {
                    if event.is_some() {
                        warn!("Connection to {} lost", id);
                        state.force(ConnectionState::Disconnected);
                        token.cancel();
                    }
                }
            }
        }))
    }
}
