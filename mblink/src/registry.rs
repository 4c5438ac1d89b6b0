//! Process-wide single-owner binding of physical endpoints

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::Instrument;

use crate::error::EndpointError;
use crate::serial::SerialSettings;
use crate::server::{ServerConfig, SharedHandler, TcpListenerTask, UdpListenerTask};

/// The kind of physical endpoint a registration is bound to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// TCP listener
    Tcp,
    /// UDP socket
    Udp,
    /// serial port
    Serial,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EndpointKind::Tcp => f.write_str("tcp"),
            EndpointKind::Udp => f.write_str("udp"),
            EndpointKind::Serial => f.write_str("serial"),
        }
    }
}

fn endpoint_key(kind: EndpointKind, target: &str) -> String {
    format!("{kind}:{target}")
}

/// A live listener bound to one physical endpoint. Obtained from, and torn
/// down through, the [`EndpointRegistry`] that created it.
#[derive(Debug)]
pub struct ListenerRegistration {
    kind: EndpointKind,
    key: String,
    serial_settings: Option<SerialSettings>,
    // dropping the sender stops the listener task and all its sessions
    shutdown: Mutex<Option<tokio::sync::mpsc::Sender<()>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ListenerRegistration {
    fn new(
        kind: EndpointKind,
        key: String,
        serial_settings: Option<SerialSettings>,
        shutdown: tokio::sync::mpsc::Sender<()>,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            key,
            serial_settings,
            shutdown: Mutex::new(Some(shutdown)),
            task: Mutex::new(Some(task)),
        }
    }

    /// The endpoint kind this registration serves
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// The registry key, e.g. `"tcp:127.0.0.1:502"`
    pub fn key(&self) -> &str {
        &self.key
    }

    fn stop(&self) {
        if let Ok(mut guard) = self.shutdown.lock() {
            if guard.take().is_some() {
                tracing::info!("stopping listener {}", self.key);
            }
        }
    }

    // wait for the listener task to exit so that the endpoint is free again
    async fn join(&self) {
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns every listener in the process. Creating a listener for a key that is
/// already bound returns the existing registration instead of binding twice.
#[derive(Default)]
pub struct EndpointRegistry {
    entries: tokio::sync::Mutex<BTreeMap<String, Arc<ListenerRegistration>>>,
}

impl EndpointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a TCP listener on `addr` and serve `handler`, or return the
    /// registration already bound there. Parameters of the new call are
    /// ignored when the endpoint already exists.
    pub async fn create_or_get_tcp(
        &self,
        addr: SocketAddr,
        config: ServerConfig,
        handler: SharedHandler,
    ) -> Result<Arc<ListenerRegistration>, EndpointError> {
        let key = endpoint_key(EndpointKind::Tcp, &addr.to_string());
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&key) {
            return Ok(existing.clone());
        }

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let mut task = TcpListenerTask::new(listener, handler, config);
        let span = tracing::info_span!("listener", endpoint = %key);
        let handle = tokio::spawn(async move { task.run(rx).instrument(span).await });

        let registration = Arc::new(ListenerRegistration::new(
            EndpointKind::Tcp,
            key.clone(),
            None,
            tx,
            handle,
        ));
        entries.insert(key, registration.clone());
        Ok(registration)
    }

    /// Bind a UDP socket on `addr` and serve `handler`, or return the
    /// registration already bound there
    pub async fn create_or_get_udp(
        &self,
        addr: SocketAddr,
        config: ServerConfig,
        handler: SharedHandler,
    ) -> Result<Arc<ListenerRegistration>, EndpointError> {
        let key = endpoint_key(EndpointKind::Udp, &addr.to_string());
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&key) {
            return Ok(existing.clone());
        }

        let socket = tokio::net::UdpSocket::bind(addr).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let mut task = UdpListenerTask::new(socket, handler, config);
        let span = tracing::info_span!("listener", endpoint = %key);
        let handle = tokio::spawn(async move { task.run(rx).instrument(span).await });

        let registration = Arc::new(ListenerRegistration::new(
            EndpointKind::Udp,
            key.clone(),
            None,
            tx,
            handle,
        ));
        entries.insert(key, registration.clone());
        Ok(registration)
    }

    /// Open the serial port at `path` and serve `handler`. An existing
    /// registration with identical settings is returned as-is; one with
    /// different settings is closed and replaced.
    #[cfg(feature = "serial")]
    pub async fn create_or_get_serial(
        &self,
        path: &str,
        settings: SerialSettings,
        config: ServerConfig,
        handler: SharedHandler,
    ) -> Result<Arc<ListenerRegistration>, EndpointError> {
        if path.is_empty() {
            return Err(crate::error::ConfigError::EmptyDevicePath.into());
        }
        // bad settings must not tear down a working listener
        settings.validate()?;

        let key = endpoint_key(EndpointKind::Serial, path);
        let mut entries = self.entries.lock().await;

        let replaced = match entries.get(&key) {
            Some(existing) if existing.serial_settings == Some(settings) => {
                return Ok(existing.clone());
            }
            Some(existing) => Some(existing.clone()),
            None => None,
        };
        if let Some(old) = replaced {
            tracing::info!("replacing listener {} with new serial settings", key);
            entries.remove(&key);
            old.stop();
            // the port is opened exclusively, release it before reopening
            old.join().await;
        }

        let stream = crate::serial::open(path, &settings)?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let task = crate::server::SerialListenerTask::new(stream, &settings, handler, config);
        let span = tracing::info_span!("listener", endpoint = %key);
        let handle = tokio::spawn(async move { task.run(rx).instrument(span).await });

        let registration = Arc::new(ListenerRegistration::new(
            EndpointKind::Serial,
            key.clone(),
            Some(settings),
            tx,
            handle,
        ));
        entries.insert(key, registration.clone());
        Ok(registration)
    }

    /// Stop a registration and remove it. The endpoint is free for rebinding
    /// when this returns. Closing a registration twice, or one the registry
    /// no longer owns, is a no-op.
    pub async fn close(&self, registration: &Arc<ListenerRegistration>) {
        {
            let mut entries = self.entries.lock().await;
            if let Some(stored) = entries.get(registration.key()) {
                if Arc::ptr_eq(stored, registration) {
                    entries.remove(registration.key());
                }
            }
        }
        registration.stop();
        registration.join().await;
    }

    /// Stop and remove every registration, waiting for each listener task to
    /// exit
    pub async fn close_all(&self) {
        let drained = {
            let mut entries = self.entries.lock().await;
            std::mem::take(&mut *entries)
        };
        for (_, registration) in drained {
            registration.stop();
            registration.join().await;
        }
    }

    /// Look up the live registration for an endpoint, if any
    pub async fn lookup(
        &self,
        kind: EndpointKind,
        target: &str,
    ) -> Option<Arc<ListenerRegistration>> {
        let key = endpoint_key(kind, target);
        self.entries.lock().await.get(&key).cloned()
    }
}
