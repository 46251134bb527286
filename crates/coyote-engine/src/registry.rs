//! Controller registry.
//!
//! One [`GameRegistry`] per process maps client ids to their
//! [`GameController`]s and hands every controller the shared waveform library
//! and settings cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::broadcast;

use coyote_core::protocol::{ret_code, MessageType};

use crate::cache::ConfigCache;
use crate::controller::{
    ControllerOptions, GameController, GameError, GameEvent, GameResult, StrengthConfig,
};
use crate::library::PulseLibrary;
use crate::session::{DgLabSession, SessionConfig, SessionError};
use crate::transport::{read_hello, spawn_line_transport, TransportConfig};

type GameMap = Arc<Mutex<HashMap<String, Arc<GameController>>>>;

/// Registry settings.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Options for newly created controllers
    pub controller: ControllerOptions,
    /// Start the game as soon as a device binds
    pub autostart: bool,
    /// Transport settings for accepted streams
    pub transport: TransportConfig,
    /// Session settings for accepted streams
    pub session: SessionConfig,
    /// How long an accepted stream may take to send its hello line
    pub hello_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            controller: ControllerOptions::default(),
            autostart: false,
            transport: TransportConfig::default(),
            session: SessionConfig::default(),
            hello_timeout: Duration::from_secs(2),
        }
    }
}

/// Owner of all live controllers.
pub struct GameRegistry {
    library: Arc<PulseLibrary>,
    cache: Arc<ConfigCache<StrengthConfig>>,
    config: RegistryConfig,
    games: GameMap,
}

impl GameRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        library: Arc<PulseLibrary>,
        cache: Arc<ConfigCache<StrengthConfig>>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            library,
            cache,
            config,
            games: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn games(&self) -> MutexGuard<'_, HashMap<String, Arc<GameController>>> {
        self.games.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared waveform library.
    #[must_use]
    pub fn library(&self) -> &Arc<PulseLibrary> {
        &self.library
    }

    /// Live controller for `client_id`.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<GameController>> {
        self.games().get(client_id).filter(|g| !g.is_closed()).cloned()
    }

    /// Number of registered controllers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.games().len()
    }

    /// Whether no controller is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.games().is_empty()
    }

    /// Client ids with a registered controller.
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.games().keys().cloned().collect()
    }

    /// Controller for `client_id`, created and initialised on first use.
    ///
    /// The controller is removed again once it emits [`GameEvent::Close`].
    pub fn get_or_create(&self, client_id: &str) -> Arc<GameController> {
        let mut games = self.games();
        if let Some(game) = games.get(client_id).filter(|g| !g.is_closed()) {
            return Arc::clone(game);
        }

        let game = GameController::new(
            client_id,
            Arc::clone(&self.library),
            Some(Arc::clone(&self.cache)),
            self.config.controller.clone(),
        );
        let events = game.subscribe();
        game.initialize();

        games.insert(client_id.to_string(), Arc::clone(&game));
        tokio::spawn(remove_on_close(Arc::clone(&self.games), Arc::downgrade(&game), events));

        tracing::info!("Game controller created: {}", client_id);
        game
    }

    /// Run a device connection end to end: hello line, bind handshake,
    /// then [`Self::attach`].
    ///
    /// The client id comes from the hello line so a reconnecting device
    /// finds its cached settings. Without one the session picks a random id.
    ///
    /// # Errors
    ///
    /// Returns the transport or handshake failure, or the error of
    /// [`Self::attach`].
    pub async fn accept<S>(&self, stream: S) -> GameResult<Arc<GameController>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stream = BufReader::new(stream);
        let client_id = read_hello(&mut stream, self.config.hello_timeout)
            .await
            .map_err(SessionError::from)?;
        if client_id.is_none() {
            tracing::debug!("No hello line, generating a client id");
        }

        let link = spawn_line_transport(stream, self.config.transport.clone());
        let session = DgLabSession::connect(link, client_id, self.config.session.clone()).await?;
        self.attach(session).await
    }

    /// Bind a freshly connected session to its controller.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::AlreadyBound`] when another live device holds the
    /// client id; that session receives an `error/400` frame and is closed.
    pub async fn attach(&self, session: Arc<DgLabSession>) -> GameResult<Arc<GameController>> {
        let client_id = session.client_id().to_string();
        let game = self.get_or_create(&client_id);

        let duplicate = game
            .session()
            .is_some_and(|bound| !bound.is_closed() && !Arc::ptr_eq(&bound, &session));
        if duplicate {
            tracing::warn!("Rejected duplicate connection for {}", client_id);
            if let Err(e) = session.send(MessageType::Error, ret_code::ID_ALREADY_BOUND).await {
                tracing::warn!("Failed to notify duplicate {}: {}", client_id, e);
            }
            session.close().await;
            return Err(GameError::AlreadyBound(client_id));
        }

        game.bind_client(session).await?;
        if self.config.autostart {
            game.start_game().await;
        }
        Ok(game)
    }

    /// Close every device and destroy every controller.
    pub async fn shutdown(&self) {
        let games: Vec<_> = self.games().drain().map(|(_, game)| game).collect();
        for game in games {
            if let Some(session) = game.session() {
                session.close().await;
            }
            game.destroy().await;
        }
    }
}

async fn remove_on_close(
    games: GameMap,
    game: std::sync::Weak<GameController>,
    mut events: broadcast::Receiver<GameEvent>,
) {
    loop {
        match events.recv().await {
            Ok(GameEvent::Close) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }

    let mut games = games.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(client_id) = games
        .iter()
        .find(|(_, g)| std::ptr::eq(Arc::as_ptr(g), game.as_ptr()))
        .map(|(id, _)| id.clone())
    else {
        return;
    };
    games.remove(&client_id);
    tracing::info!("Game controller removed: {}", client_id);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connect_pair, connect_simulated, DeviceSim, FakeDevice};
    use crate::transport::RemotePeer;

    fn registry(autostart: bool) -> GameRegistry {
        GameRegistry::new(
            Arc::new(PulseLibrary::from_scripts(Vec::new())),
            Arc::new(ConfigCache::default()),
            RegistryConfig {
                autostart,
                transport: TransportConfig {
                    idle_timeout: None,
                    ..TransportConfig::default()
                },
                ..RegistryConfig::default()
            },
        )
    }

    /// Connect a simulated device through [`GameRegistry::accept`].
    async fn accept_device(
        registry: &GameRegistry,
        hello: &str,
    ) -> (GameResult<Arc<GameController>>, DeviceSim) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let mut device = FakeDevice::new(RemotePeer::new(remote));
        let hello = hello.to_string();

        tokio::join!(registry.accept(local), async move {
            device.send_hello(&hello).await;
            device.accept_bind().await;
            device.drain_reset().await;
            device.simulate(20, 20)
        })
    }

    async fn wait_until_empty(registry: &GameRegistry) {
        for _ in 0..100 {
            if registry.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry still holds {:?}", registry.client_ids());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_create_reuses_controller() {
        let registry = registry(false);
        let first = registry.get_or_create("dev1");
        let second = registry.get_or_create("dev1");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("dev2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_with_autostart() {
        let registry = registry(true);
        let (session, _sim) = connect_simulated("dev1", 20, 20).await;

        let game = registry.attach(session).await.unwrap();
        assert!(game.is_running().await);
        assert!(game.has_live_client());

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_client_is_rejected() {
        let registry = registry(false);
        let (first, _sim) = connect_simulated("dev1", 20, 20).await;
        registry.attach(first).await.unwrap();

        let (second, mut device) = connect_pair(Some("dev1")).await;
        let err = registry.attach(second).await.unwrap_err();
        assert!(matches!(err, GameError::AlreadyBound(ref id) if id == "dev1"));

        let mut kinds = Vec::new();
        while let Some(envelope) = device.recv_envelope().await {
            if envelope.kind != MessageType::Msg {
                kinds.push((envelope.kind, envelope.message));
            }
        }
        assert_eq!(
            kinds,
            vec![
                (MessageType::Error, ret_code::ID_ALREADY_BOUND.to_string()),
                (MessageType::Break, ret_code::CLIENT_DISCONNECTED.to_string()),
            ]
        );
        assert!(registry.get("dev1").unwrap().has_live_client());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_uses_hello_client_id() {
        let registry = registry(false);

        let (game, _sim) = accept_device(&registry, "dev1").await;
        let game = game.unwrap();
        assert_eq!(game.client_id(), "dev1");
        assert!(game.has_live_client());
        assert!(registry.get("dev1").is_some());

        let (anonymous, _other) = accept_device(&registry, "").await;
        let anonymous = anonymous.unwrap();
        assert_ne!(anonymous.client_id(), "dev1");
        assert!(!anonymous.client_id().is_empty());
        assert_eq!(registry.len(), 2);

        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_strength_config() {
        let registry = registry(false);
        let (game, sim) = accept_device(&registry, "dev1").await;
        let game = game.unwrap();

        let custom = StrengthConfig {
            strength: 9,
            random_strength: 4,
        };
        game.update_strength_config(custom).await.unwrap();

        sim.handle.abort();
        wait_until_empty(&registry).await;

        let (again, _sim) = accept_device(&registry, "/dev1").await;
        let again = again.unwrap();
        assert!(!Arc::ptr_eq(&game, &again));
        assert_eq!(again.client_id(), "dev1");
        assert_eq!(again.strength_config(), custom);

        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_removes_and_caches_settings() {
        let registry = registry(false);
        let (session, sim) = connect_simulated("dev1", 20, 20).await;
        let game = registry.attach(session).await.unwrap();

        let custom = StrengthConfig {
            strength: 8,
            random_strength: 3,
        };
        game.update_strength_config(custom).await.unwrap();

        sim.handle.abort();
        wait_until_empty(&registry).await;
        assert!(game.is_closed());

        let restored = registry.get_or_create("dev1");
        assert!(!Arc::ptr_eq(&game, &restored));
        assert_eq!(restored.strength_config(), custom);
    }
}
