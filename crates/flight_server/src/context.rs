//! Shared handles passed to every stage constructor.

use crate::config::ServerConfig;
use crate::connection::ConnectionRegistry;
use crate::security::AdmissionControl;
use std::sync::Arc;

/// Process-wide state handed to stage constructors instead of globals.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub admission: Arc<AdmissionControl>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        let admission = Arc::new(AdmissionControl::new(&config.security));
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            admission,
        }
    }
}
