//! Multi-client call fixtures.
//!
//! A `TestCall` wires any number of session actors to one shared signaling
//! bus and one loopback network, so a whole mesh runs in a single test.

use call_core::actors::{
    ActorMetrics, NegotiatorKey, NegotiatorSnapshot, SessionActor, SessionContext, SessionHandle,
    SessionSnapshot,
};
use call_core::config::Config;
use call_core::media::MediaCaptureController;
use common::types::{ConversationId, UserId};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::mock_capture::MockCaptureBackend;
use crate::mock_peer::LoopbackNetwork;
use crate::mock_transport::MockSignalingBus;

/// How long `wait_for` and `wait_until` poll before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

static TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once per test binary.
///
/// Honours `RUST_LOG`; defaults to `call=debug`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("call=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Config with short timeouts for tests.
#[must_use]
pub fn test_config() -> Config {
    Config {
        negotiation_timeout: Duration::from_secs(5),
        duration_tick: Duration::from_secs(1),
        ..Config::default()
    }
}

/// One call shared by several test clients.
#[derive(Debug, Clone)]
pub struct TestCall {
    pub bus: MockSignalingBus,
    pub network: LoopbackNetwork,
    pub conversation_id: ConversationId,
}

impl Default for TestCall {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCall {
    /// A call on a random conversation id.
    #[must_use]
    pub fn new() -> Self {
        init_test_tracing();
        Self {
            bus: MockSignalingBus::new(),
            network: LoopbackNetwork::new(),
            conversation_id: ConversationId::new(format!("conv-{}", Uuid::new_v4())),
        }
    }

    /// Spawn a session actor for `name` with `test_config()`.
    #[must_use]
    pub fn client(&self, name: &str) -> TestClient {
        self.client_with_config(name, test_config())
    }

    /// Spawn a session actor for `name` with the given config.
    #[must_use]
    pub fn client_with_config(&self, name: &str, config: Config) -> TestClient {
        let user_id = UserId::from(name);
        let capture = MockCaptureBackend::new();
        let metrics = ActorMetrics::new();

        let context = SessionContext {
            user_id: user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            capture: MediaCaptureController::new(
                Arc::new(capture.clone()),
                config.screen_frame_rate,
            ),
            config,
            transport: Arc::new(self.bus.clone()),
            peers: Arc::new(self.network.factory_for(&user_id)),
        };

        let (handle, task) =
            SessionActor::spawn(context, CancellationToken::new(), Arc::clone(&metrics));

        TestClient {
            user_id,
            handle,
            task,
            capture,
            metrics,
        }
    }

    /// Join every name in order, with video, and wait for the full mesh:
    /// each client sees every other one with a connected media stream.
    pub async fn joined_mesh<const N: usize>(&self, names: [&str; N]) -> [TestClient; N] {
        let mut clients = Vec::with_capacity(N);
        for name in names {
            let client = self.client(name);
            client.handle.join(true).await.unwrap();
            clients.push(client);
        }

        let others = N.saturating_sub(1);
        for client in &clients {
            client
                .wait_for("full mesh", |s| {
                    s.media_peers.len() == others
                        && s.participants.len() == others
                        && s.participants.iter().all(|p| p.main_stream.is_some())
                })
                .await;
        }

        clients
            .try_into()
            .unwrap_or_else(|_| panic!("expected {N} clients"))
    }
}

/// One client of a `TestCall`.
pub struct TestClient {
    pub user_id: UserId,
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub capture: MockCaptureBackend,
    pub metrics: Arc<ActorMetrics>,
}

impl TestClient {
    /// Latest published snapshot.
    #[must_use]
    pub fn state(&self) -> SessionSnapshot {
        self.handle.watch().borrow().clone()
    }

    /// Wait until the published snapshot satisfies `check`.
    ///
    /// # Panics
    ///
    /// Panics if the condition does not hold within `WAIT_TIMEOUT`.
    pub async fn wait_for(
        &self,
        description: &str,
        check: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = self.handle.watch();
        let snapshot = match tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(check)).await {
            Ok(Ok(snapshot)) => (*snapshot).clone(),
            Ok(Err(_)) => panic!(
                "{}: session actor gone while waiting for {description}",
                self.user_id
            ),
            Err(_) => panic!(
                "{}: timed out waiting for {description}; last state: {:?}",
                self.user_id,
                self.state()
            ),
        };
        snapshot
    }

    /// Current state of the negotiator for `key`, if one is live.
    pub async fn negotiator_state(&self, key: NegotiatorKey) -> Option<NegotiatorSnapshot> {
        let handle = self.handle.negotiator(key).await.unwrap()?;
        handle.get_state().await.ok()
    }

    /// Poll the negotiator for `key` until its state satisfies `check`.
    ///
    /// # Panics
    ///
    /// Panics if the condition does not hold within `WAIT_TIMEOUT`.
    pub async fn wait_for_negotiator(
        &self,
        key: NegotiatorKey,
        description: &str,
        mut check: impl FnMut(&NegotiatorSnapshot) -> bool,
    ) -> NegotiatorSnapshot {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(snapshot) = self.negotiator_state(key.clone()).await {
                if check(&snapshot) {
                    return snapshot;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{}: timed out waiting for {description} on {key}",
                self.user_id
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Cancel the actor and wait for it to exit.
    pub async fn shutdown(self) {
        self.handle.cancel();
        let _ = tokio::time::timeout(WAIT_TIMEOUT, self.task).await;
    }
}

/// Poll `condition` until it holds.
///
/// # Errors
///
/// Returns an error if the condition does not hold within `WAIT_TIMEOUT`.
pub async fn wait_until(
    description: &str,
    mut condition: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {description}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
