//! An LMTP delivery server with onward proxying.
//!
//! Mail arrives over LMTP from a trusted submitter (usually a front
//! proxy). Each recipient resolves through the user directory to
//! either a local save via the mail store or a relay hop to another
//! server, with per-user concurrency accounting via the anvil broker
//! and one reply per recipient after DATA, as LMTP requires.

use std::sync::Arc;

pub mod address;
pub mod anvil;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod dot;
pub mod headers;
pub mod maildir;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod spool;
pub mod store;
pub mod tls;

use anvil::AnvilClient;
use config::LmtpSettings;
use directory::UserDirectory;
use store::MailStore;

/// Process-wide collaborators, initialised before the first session
/// and shared by all of them.
pub struct RuntimeContext {
    pub settings: LmtpSettings,
    pub store: Arc<dyn MailStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
    anvil: tokio::sync::Mutex<Option<Arc<AnvilClient>>>,
}

impl RuntimeContext {
    pub fn new(
        settings: LmtpSettings,
        store: Arc<dyn MailStore>,
        directory: Arc<dyn UserDirectory>,
        tls: Option<tokio_rustls::TlsAcceptor>,
    ) -> Self {
        Self {
            settings,
            store,
            directory,
            tls,
            anvil: tokio::sync::Mutex::new(None),
        }
    }

    /// The shared broker connection, established on first use. A
    /// broker that cannot be reached fails open: lookups behave as
    /// if no deliveries were in flight.
    pub async fn anvil(&self) -> Option<Arc<AnvilClient>> {
        let mut guard = self.anvil.lock().await;
        if guard.is_none() {
            match AnvilClient::connect(&self.settings.base_dir).await {
                Ok(client) => *guard = Some(Arc::new(client)),
                Err(err) => {
                    tracing::error!("anvil connection failed: {err:#}");
                }
            }
        }
        guard.clone()
    }
}
