use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::channel::mpsc::unbounded;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{make_heart_rate_service_uuid, LINK_POLL_DELAY, SCAN_POLL_DELAY};
use crate::device::types::{PeripheralHandle, ServiceDescriptor};
use crate::error::TransportError;

/// The shape of the BLE stack this crate depends on. The lifecycle state
/// machine and the monitor session are written against this trait only, so
/// they can be driven by a scripted stack in tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Asks the platform for permission to use the radio. `Ok(false)` is a
    /// denial by the user or platform, `Err` a failing stack.
    async fn request_permission(&self) -> Result<bool, TransportError>;

    /// Starts radio discovery. The stream emits every sighted peripheral,
    /// possibly repeatedly; deduplication is the consumer's concern.
    async fn start_scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    /// Subscribes to notifications on the described characteristic and
    /// returns the stream of raw notification payloads, in delivery order.
    async fn subscribe(
        &self,
        handle: &PeripheralHandle,
        descriptor: &ServiceDescriptor,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    async fn unsubscribe(
        &self,
        handle: &PeripheralHandle,
        descriptor: &ServiceDescriptor,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    /// A stream that emits once when the link to the peripheral drops,
    /// whether locally requested or remote-initiated.
    async fn disconnect_events(
        &self,
        handle: &PeripheralHandle,
    ) -> Result<BoxStream<'static, ()>, TransportError>;
}

struct ScanTask {
    cancel: CancellationToken,
}

/// Production transport over btleplug. Peripherals sighted during a scan are
/// kept in a registry so later operations can resolve a handle back to the
/// platform peripheral.
pub struct BtleTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, PlatformPeripheral>>>,
    scan: Mutex<Option<ScanTask>>,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;

        Ok(BtleTransport {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan: Mutex::new(None),
        })
    }

    fn peripheral(&self, id: &str) -> Result<PlatformPeripheral, TransportError> {
        self.peripherals
            .lock()
            .expect("peripheral registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn request_permission(&self) -> Result<bool, TransportError> {
        // btleplug has no explicit consent call; the platform reports a
        // denial the first time the adapter is touched.
        match self.adapter.adapter_info().await {
            Ok(info) => {
                debug!("Using Bluetooth adapter {}", info);
                Ok(true)
            }
            Err(btleplug::Error::PermissionDenied) => Ok(false),
            Err(source) => Err(TransportError::Btle { source }),
        }
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError> {
        let filter = ScanFilter {
            services: vec![make_heart_rate_service_uuid()],
        };
        self.adapter.start_scan(filter).await?;

        let (tx, rx) = unbounded();
        let cancel = CancellationToken::new();
        let adapter = self.adapter.clone();
        let registry = Arc::clone(&self.peripherals);

        {
            let cancel = cancel.clone();
            spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(Duration::from_millis(SCAN_POLL_DELAY)) => {}
                    }

                    // Some environments ignore the filter, and names arrive
                    // late; re-announce everything the adapter has sighted.
                    let peripherals = match adapter.peripherals().await {
                        Ok(peripherals) => peripherals,
                        Err(err) => {
                            warn!("Failed to query BLE adapter for peripherals: {}", err);
                            continue;
                        }
                    };

                    for peripheral in peripherals {
                        let id = peripheral.address().to_string();
                        let name = peripheral_name(&peripheral).await;
                        registry
                            .lock()
                            .expect("peripheral registry lock poisoned")
                            .insert(id.clone(), peripheral);

                        if tx.unbounded_send(PeripheralHandle { id, name }).is_err() {
                            return;
                        }
                    }
                }
            });
        }

        let mut scan = self.scan.lock().expect("scan task lock poisoned");
        if let Some(previous) = scan.replace(ScanTask { cancel }) {
            previous.cancel.cancel();
        }

        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        {
            let mut scan = self.scan.lock().expect("scan task lock poisoned");
            if let Some(task) = scan.take() {
                task.cancel.cancel();
            }
        }

        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.id)?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.id)?;
        peripheral.discover_services().await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &PeripheralHandle,
        descriptor: &ServiceDescriptor,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let peripheral = self.peripheral(&handle.id)?;
        let characteristic = find_characteristic(&peripheral, descriptor)?;

        debug!("Subscribing to characteristic {:?}", characteristic.uuid);
        peripheral.subscribe(&characteristic).await?;

        let uuid = descriptor.characteristic;
        let stream = peripheral
            .notifications()
            .await?
            .filter_map(move |notification| async move {
                (notification.uuid == uuid).then_some(notification.value)
            })
            .boxed();

        Ok(stream)
    }

    async fn unsubscribe(
        &self,
        handle: &PeripheralHandle,
        descriptor: &ServiceDescriptor,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.id)?;
        let characteristic = find_characteristic(&peripheral, descriptor)?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.id)?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn disconnect_events(
        &self,
        handle: &PeripheralHandle,
    ) -> Result<BoxStream<'static, ()>, TransportError> {
        let peripheral = self.peripheral(&handle.id)?;
        let (tx, rx) = unbounded();

        spawn(async move {
            loop {
                sleep(Duration::from_millis(LINK_POLL_DELAY)).await;
                if tx.is_closed() {
                    return;
                }

                match peripheral.is_connected().await {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = tx.unbounded_send(());
                        return;
                    }
                    Err(err) => {
                        // treat a stack that cannot answer as a lost link
                        warn!("Error checking for connection state: {:?}", err);
                        let _ = tx.unbounded_send(());
                        return;
                    }
                }
            }
        });

        Ok(rx.boxed())
    }
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    descriptor: &ServiceDescriptor,
) -> Result<Characteristic, TransportError> {
    for characteristic in peripheral.characteristics() {
        if characteristic.service_uuid == descriptor.service
            && characteristic.uuid == descriptor.characteristic
            && characteristic.properties.contains(CharPropFlags::NOTIFY)
        {
            return Ok(characteristic);
        }
    }

    Err(TransportError::MissingCharacteristic)
}

async fn peripheral_name(peripheral: &PlatformPeripheral) -> Option<String> {
    let Ok(Some(properties)) = peripheral.properties().await else {
        return None;
    };

    properties.local_name
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures::channel::mpsc::UnboundedSender;
    use futures::future::pending;

    use super::*;

    /// A scripted stack: tests queue advertisements, inject notification
    /// payloads, and drop the link; counters record every release call.
    pub struct MockTransport {
        advertised: Mutex<Vec<PeripheralHandle>>,
        scan_tx: Mutex<Option<UnboundedSender<PeripheralHandle>>>,
        notify_tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
        disconnect_tx: Mutex<Option<UnboundedSender<()>>>,
        pub permission: AtomicBool,
        pub refuse_connect: AtomicBool,
        pub hang_connect: AtomicBool,
        pub stop_scan_calls: AtomicUsize,
        pub subscribe_calls: AtomicUsize,
        pub unsubscribe_calls: AtomicUsize,
        pub disconnect_calls: AtomicUsize,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(MockTransport {
                advertised: Mutex::new(vec![]),
                scan_tx: Mutex::new(None),
                notify_tx: Mutex::new(None),
                disconnect_tx: Mutex::new(None),
                permission: AtomicBool::new(true),
                refuse_connect: AtomicBool::new(false),
                hang_connect: AtomicBool::new(false),
                stop_scan_calls: AtomicUsize::new(0),
                subscribe_calls: AtomicUsize::new(0),
                unsubscribe_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
            })
        }

        /// Queues a peripheral advertisement; delivered on the running scan
        /// stream, or replayed when the next scan starts.
        pub fn advertise(&self, handle: PeripheralHandle) {
            let scan_tx = self.scan_tx.lock().unwrap();
            if let Some(tx) = scan_tx.as_ref() {
                if tx.unbounded_send(handle.clone()).is_ok() {
                    return;
                }
            }
            drop(scan_tx);
            self.advertised.lock().unwrap().push(handle);
        }

        pub fn inject_notification(&self, value: Vec<u8>) {
            let notify_tx = self.notify_tx.lock().unwrap();
            let tx = notify_tx.as_ref().expect("no active subscription");
            tx.unbounded_send(value).expect("subscription stream closed");
        }

        /// Simulates a remote-initiated disconnect.
        pub fn drop_link(&self) {
            if let Some(tx) = self.disconnect_tx.lock().unwrap().take() {
                let _ = tx.unbounded_send(());
            }
            // the subscription dies with the link
            self.notify_tx.lock().unwrap().take();
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn request_permission(&self) -> Result<bool, TransportError> {
            Ok(self.permission.load(Ordering::Acquire))
        }

        async fn start_scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError> {
            let (tx, rx) = unbounded();
            for handle in self.advertised.lock().unwrap().drain(..) {
                let _ = tx.unbounded_send(handle);
            }
            *self.scan_tx.lock().unwrap() = Some(tx);
            Ok(rx.boxed())
        }

        async fn stop_scan(&self) -> Result<(), TransportError> {
            self.stop_scan_calls.fetch_add(1, Ordering::AcqRel);
            self.scan_tx.lock().unwrap().take();
            Ok(())
        }

        async fn connect(&self, _handle: &PeripheralHandle) -> Result<(), TransportError> {
            if self.hang_connect.load(Ordering::Acquire) {
                pending::<()>().await;
            }
            if self.refuse_connect.load(Ordering::Acquire) {
                return Err(TransportError::LinkClosed);
            }
            Ok(())
        }

        async fn discover_services(&self, _handle: &PeripheralHandle) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _handle: &PeripheralHandle,
            _descriptor: &ServiceDescriptor,
        ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
            self.subscribe_calls.fetch_add(1, Ordering::AcqRel);
            let (tx, rx) = unbounded();
            *self.notify_tx.lock().unwrap() = Some(tx);
            Ok(rx.boxed())
        }

        async fn unsubscribe(
            &self,
            _handle: &PeripheralHandle,
            _descriptor: &ServiceDescriptor,
        ) -> Result<(), TransportError> {
            self.unsubscribe_calls.fetch_add(1, Ordering::AcqRel);
            self.notify_tx.lock().unwrap().take();
            Ok(())
        }

        async fn disconnect(&self, _handle: &PeripheralHandle) -> Result<(), TransportError> {
            self.disconnect_calls.fetch_add(1, Ordering::AcqRel);
            self.notify_tx.lock().unwrap().take();
            self.disconnect_tx.lock().unwrap().take();
            Ok(())
        }

        async fn disconnect_events(
            &self,
            _handle: &PeripheralHandle,
        ) -> Result<BoxStream<'static, ()>, TransportError> {
            let (tx, rx) = unbounded();
            *self.disconnect_tx.lock().unwrap() = Some(tx);
            Ok(rx.boxed())
        }
    }
}
