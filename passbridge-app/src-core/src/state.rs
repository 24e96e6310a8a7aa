use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::auth::AuthLedger;
use crate::error::Result;
use crate::gateway::PairingGateway;
use crate::session::{SessionConfig, SessionManager};
use crate::storage::{AppSettings, AppStore, FileVaultStore, VaultStore};
use crate::vault::VaultManager;

/// Everything the command surface and the gateway share.
pub struct AppState {
    pub data_dir: Option<PathBuf>,
    pub settings: AppSettings,
    pub app_store: Arc<AppStore>,
    pub ledger: Arc<AuthLedger>,
    pub sessions: Arc<SessionManager>,
    pub vault: Arc<VaultManager>,
    pub gateway: Arc<PairingGateway>,
}

impl AppState {
    /// Open the vault and app state files under `data_dir`.
    pub fn open(data_dir: &Path, settings: AppSettings) -> Result<Self> {
        let store: Arc<dyn VaultStore> = Arc::new(FileVaultStore::open(data_dir)?);
        let app_store = Arc::new(AppStore::open(data_dir));
        info!("Loaded state from {:?}", data_dir);
        Ok(Self::assemble(
            Some(data_dir.to_path_buf()),
            settings,
            store,
            app_store,
        ))
    }

    /// Purely in-memory state.
    pub fn in_memory(settings: AppSettings) -> Self {
        Self::assemble(
            None,
            settings,
            Arc::new(FileVaultStore::in_memory()),
            Arc::new(AppStore::in_memory()),
        )
    }

    fn assemble(
        data_dir: Option<PathBuf>,
        settings: AppSettings,
        store: Arc<dyn VaultStore>,
        app_store: Arc<AppStore>,
    ) -> Self {
        let ledger = Arc::new(AuthLedger::new());
        let sessions = Arc::new(SessionManager::new(
            store,
            app_store.clone(),
            ledger.clone(),
            SessionConfig::from(&settings),
        ));
        let vault = Arc::new(VaultManager::new(sessions.clone()));
        let gateway = Arc::new(PairingGateway::new(
            vault.clone(),
            app_store.clone(),
            settings.transport_obfuscation,
        ));

        Self {
            data_dir,
            settings,
            app_store,
            ledger,
            sessions,
            vault,
            gateway,
        }
    }

    /// Prune idle rate-limit records. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.ledger.sweep() + self.gateway.sweep()
    }
}
