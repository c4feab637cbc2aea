//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::experiment::registry::ULTIMATUM_GROUP;
use crate::experiment::sequencer::SessionSettings;
use crate::experiment::{SessionRegistry, SetupError, StageRegistry};
use crate::lobby::{LobbyConfig, LobbyService};
use crate::store::{CheckoutClient, CodeStore, CodeStoreError};
use crate::ws::hub::ConnectionHub;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub codes: Arc<CodeStore>,
    pub hub: Arc<ConnectionHub>,
    pub lobby: Arc<LobbyService>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, StartupError> {
        let config = Arc::new(config);

        // Expected participant set; an empty file fails here
        let codes = Arc::new(CodeStore::from_file(&config.codes_file)?);

        // Stage plot is validated before anyone can join
        let registry = StageRegistry::ultimatum(config.rounds, config.min_players)?;
        let plot = registry.sequence_for(ULTIMATUM_GROUP)?;

        let hub = Arc::new(ConnectionHub::new());
        let sessions = Arc::new(SessionRegistry::new());
        let checkout = Arc::new(CheckoutClient::new(
            codes.clone(),
            config.checkout_url.clone(),
            config.ecu_per_unit,
        ));

        let lobby = Arc::new(LobbyService::new(
            LobbyConfig {
                group_size: config.group_size,
                plot,
                settings: SessionSettings {
                    countdown: config.disconnect_countdown,
                    terminated_url: config.terminated_url(),
                    unauthorized_url: config.unauthorized_url(),
                },
            },
            sessions.clone(),
            codes.clone(),
            hub.clone(),
            checkout,
        ));

        Ok(Self {
            config,
            codes,
            hub,
            lobby,
            sessions,
        })
    }
}

/// Failures while assembling the application
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to load participant codes: {0}")]
    Codes(#[from] CodeStoreError),

    #[error("Invalid stage setup: {0}")]
    Setup(#[from] SetupError),
}
