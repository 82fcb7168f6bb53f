//! Shared collaborators handed to every module.

use std::fmt;
use std::sync::Arc;

use phantom_system::{
    CancellationToken, Clock, Executor, OsRandom, RandomSource, SystemClock, SystemExecutor,
};

use crate::config::PhantomConfig;
use crate::error::Result;
use crate::settings::{Paths, Settings};
use crate::store::DataStore;

/// Settings plus the injected executor, clock and randomness.
///
/// Cheap to clone; every handler owns one.
#[derive(Clone)]
pub struct Context {
    settings: Arc<Settings>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    cancel: CancellationToken,
}

impl Context {
    /// Builds a context from explicit collaborators.
    #[must_use]
    pub fn new(
        settings: Settings,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            executor,
            clock,
            random,
            cancel: CancellationToken::new(),
        }
    }

    /// Context that talks to the real host.
    #[must_use]
    pub fn system(settings: Settings) -> Self {
        Self::new(
            settings,
            Arc::new(SystemExecutor::new()),
            Arc::new(SystemClock),
            Arc::new(OsRandom),
        )
    }

    /// Replaces the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Filesystem layout.
    #[must_use]
    pub fn paths(&self) -> &Paths {
        &self.settings.paths
    }

    /// Command executor.
    #[must_use]
    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Wall clock.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Randomness for keys and secrets.
    #[must_use]
    pub fn random(&self) -> &dyn RandomSource {
        self.random.as_ref()
    }

    /// Token that aborts long waits.
    #[must_use]
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Loads `phantom.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid.
    pub fn load_config(&self) -> Result<PhantomConfig> {
        PhantomConfig::load(&self.paths().phantom_json())
    }

    /// Saves `phantom.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_config(&self, config: &PhantomConfig) -> Result<()> {
        config.save(&self.paths().phantom_json())
    }

    /// Opens the client store for the configured subnet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store file exists but is unreadable.
    pub fn open_store(&self, config: &PhantomConfig) -> Result<DataStore> {
        DataStore::open(&self.paths().clients_db(), config.wireguard.network)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
