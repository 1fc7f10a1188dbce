//! Connection manager - bus session and reply subscription lifecycle
//!
//! A connection is one bus session plus exactly one subscription to this
//! instance's reply channel. The subscription is drained by a pump task that
//! hands every reply to the pending table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use procbus::{BusReceiver, ProcessManager};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correlator::PendingTable;
use crate::envelope::ResponseEnvelope;
use crate::error::{FanoutError, FanoutResult};
use crate::identity::Identity;

/// A live session: the reply channel and the task draining it
struct Connection {
    channel: String,
    pump: JoinHandle<()>,
}

/// Owns the connection to the process manager
pub struct ConnectionManager {
    manager: Arc<dyn ProcessManager>,
    identity: Identity,
    pending: PendingTable,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl ConnectionManager {
    pub fn new(manager: Arc<dyn ProcessManager>, identity: Identity, pending: PendingTable) -> Self {
        debug!(instance_id = ?identity.instance_id, "ConnectionManager::new: called");
        Self {
            manager,
            identity,
            pending,
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The process manager this connection talks to
    pub fn manager(&self) -> &Arc<dyn ProcessManager> {
        &self.manager
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether a live reply subscription exists
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the bus session and install the reply subscription
    ///
    /// Calling this while connected is a no-op; it never subscribes twice.
    pub async fn connect(&self) -> FanoutResult<()> {
        let mut connection = self.connection.lock().await;

        if connection.is_some() {
            if self.is_connected() {
                debug!("ConnectionManager::connect: already connected");
                return Ok(());
            }
            // Pump ended on its own (bus closed); start over
            if let Some(stale) = connection.take() {
                stale.pump.abort();
            }
        }

        self.manager.connect_bus().await.map_err(FanoutError::Connection)?;

        let channel = self.identity.reply_channel();
        let rx = match self.manager.subscribe(&channel).await {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(close_err) = self.manager.disconnect_bus().await {
                    warn!(error = %close_err, "ConnectionManager: failed to close session after subscribe error");
                }
                return Err(FanoutError::Connection(e));
            }
        };

        self.connected.store(true, Ordering::SeqCst);
        let pump = tokio::spawn(pump_replies(
            rx,
            self.pending.clone(),
            self.connected.clone(),
            channel.clone(),
        ));

        info!(%channel, "Connected to process manager");
        *connection = Some(Connection { channel, pump });
        Ok(())
    }

    /// Remove the subscription and close the bus session
    ///
    /// Pending requests are left alone; they end through their own timeouts.
    pub async fn disconnect(&self) -> FanoutResult<()> {
        let mut connection = self.connection.lock().await;
        let Some(current) = connection.take() else {
            debug!("ConnectionManager::disconnect: not connected");
            return Ok(());
        };

        self.connected.store(false, Ordering::SeqCst);
        current.pump.abort();
        // Wait for the pump to drop its receiver so the subscription is released
        let _ = current.pump.await;

        self.manager.disconnect_bus().await.map_err(FanoutError::Connection)?;
        info!(channel = %current.channel, pending = self.pending.len(), "Disconnected from process manager");
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(current) = self.connection.get_mut().take() {
            current.pump.abort();
        }
    }
}

async fn pump_replies(mut rx: BusReceiver, pending: PendingTable, connected: Arc<AtomicBool>, channel: String) {
    debug!(%channel, "pump_replies: started");
    while let Some(packet) = rx.recv().await {
        match ResponseEnvelope::from_packet(packet) {
            Ok(response) => {
                let outcome = pending.deliver(response);
                debug!(?outcome, "pump_replies: delivered");
            }
            Err(e) => {
                warn!(%channel, error = %e, "pump_replies: ignoring malformed reply");
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    warn!(%channel, "pump_replies: subscription closed by the bus");
}
