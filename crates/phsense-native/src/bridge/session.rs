//! Connection session state machine.
//!
//! ```text
//! Idle ──connect──► Connecting ──link up──► ServiceDiscovery ──subscribed──► Subscribed
//!                       │                         │                              │
//!                       └─────────failure / peripheral drop / disconnect─────────┴──► Disconnected
//! ```
//!
//! A [`SessionSlot`] holds at most one session. A session leaves the slot
//! the moment it is torn down, so a late notification or a late step of an
//! aborted connect finds nothing to act on.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use phsense_core::protocol::{CALIBRATION_CHAR_UUID, PH_READING_CHAR_UUID, PH_SERVICE_UUID};
use phsense_core::types::DeviceId;

use super::config::SessionConfig;
use super::error::{SessionError, SessionResult};
use super::platform::{BlePlatform, DiscoveredCharacteristic, PlatformResult};

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a connection session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing requested yet
    Idle,
    /// Waiting for the transport link
    Connecting,
    /// Link up, discovering services
    ServiceDiscovery,
    /// Notifications flowing
    Subscribed,
    /// Torn down (terminal for this session)
    Disconnected,
}

impl SessionState {
    /// Whether this state occupies the single connection.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::Subscribed
        )
    }

    /// Whether `next` is a legal successor.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Connecting)
                | (Self::Connecting, Self::ServiceDiscovery)
                | (Self::ServiceDiscovery, Self::Subscribed)
                | (Self::Idle | Self::Connecting | Self::ServiceDiscovery | Self::Subscribed, Self::Disconnected)
        )
    }
}

/// One connection attempt and, if it succeeds, the live connection.
#[derive(Debug)]
pub struct Session {
    device_id: DeviceId,
    state: SessionState,
    generation: u64,
    opened_at: Instant,
}

impl Session {
    fn new(device_id: DeviceId, generation: u64) -> Self {
        Self {
            device_id,
            state: SessionState::Idle,
            generation,
            opened_at: Instant::now(),
        }
    }

    /// Device bound to this session.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Number of the connect attempt that created this session.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Time since the connect request.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    fn advance(&mut self, next: SessionState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Slot
// ============================================================================

/// Holder of the single system-wide session.
#[derive(Debug, Default)]
pub struct SessionSlot {
    current: Option<Session>,
    next_generation: u64,
}

impl SessionSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `id`. Returns the generation of the new session.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionActive`] naming the device that holds the slot.
    pub fn begin(&mut self, id: &DeviceId) -> SessionResult<u64> {
        if let Some(current) = self.current.as_ref().filter(|s| s.state.is_active()) {
            return Err(SessionError::SessionActive(current.device_id.clone()));
        }

        self.next_generation += 1;
        let mut session = Session::new(id.clone(), self.next_generation);
        session.advance(SessionState::Connecting);
        self.current = Some(session);
        Ok(self.next_generation)
    }

    /// Move the session created by `generation` to `next`.
    ///
    /// # Errors
    ///
    /// [`SessionError::Aborted`] if that session has been torn down or
    /// replaced, or if `next` is not a legal successor.
    pub fn advance(&mut self, generation: u64, id: &DeviceId, next: SessionState) -> SessionResult<()> {
        match self.current.as_mut() {
            Some(session) if session.generation == generation => {
                if !session.advance(next) {
                    return Err(SessionError::Aborted(id.clone()));
                }
                debug!("Session for {id} -> {next:?}");
                Ok(())
            }
            _ => Err(SessionError::Aborted(id.clone())),
        }
    }

    /// Drop the session created by `generation`, if it is still there.
    pub fn release(&mut self, generation: u64) {
        if self.current.as_ref().is_some_and(|s| s.generation == generation) {
            self.current = None;
        }
    }

    /// Tear down the session for `id`, returning it in the
    /// [`SessionState::Disconnected`] state together with the state it was
    /// in. Returns `None` when `id` has no session.
    pub fn take(&mut self, id: &DeviceId) -> Option<(Session, SessionState)> {
        if !self.current.as_ref().is_some_and(|s| &s.device_id == id) {
            return None;
        }
        let mut session = self.current.take()?;
        let previous = session.state;
        session.advance(SessionState::Disconnected);
        Some((session, previous))
    }

    /// Like [`SessionSlot::take`], but only for the session created by
    /// `generation`.
    pub fn take_generation(&mut self, generation: u64) -> Option<(Session, SessionState)> {
        if !self.current.as_ref().is_some_and(|s| s.generation == generation) {
            return None;
        }
        let mut session = self.current.take()?;
        let previous = session.state;
        session.advance(SessionState::Disconnected);
        Some((session, previous))
    }

    /// Whether `id` has a subscribed session.
    #[must_use]
    pub fn is_subscribed(&self, id: &DeviceId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| &s.device_id == id && s.state == SessionState::Subscribed)
    }

    /// The current session, if any.
    #[must_use]
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }
}

// ============================================================================
// Connect Procedure
// ============================================================================

/// Runs the platform side of a connect: link, discovery, subscription.
///
/// Each step is reported through the `advance` callback before it starts,
/// so the owner can veto it (the session may have been torn down in the
/// meantime). On any failure after the link was requested the link is
/// cancelled again.
pub(crate) struct Connector<'a> {
    platform: &'a dyn BlePlatform,
    config: &'a SessionConfig,
}

impl<'a> Connector<'a> {
    pub(crate) fn new(platform: &'a dyn BlePlatform, config: &'a SessionConfig) -> Self {
        Self { platform, config }
    }

    pub(crate) async fn open<F>(&self, id: &DeviceId, mut advance: F) -> SessionResult<()>
    where
        F: FnMut(SessionState) -> SessionResult<()> + Send,
    {
        info!("Connecting to {id}");
        let result = self.establish(id, &mut advance).await;
        if let Err(e) = &result {
            debug!("Cancelling link to {id} after failed connect: {e}");
            if let Err(cancel) = self.platform.disconnect(id).await {
                debug!("Link cancel for {id} failed: {cancel}");
            }
        }
        result
    }

    async fn establish<F>(&self, id: &DeviceId, advance: &mut F) -> SessionResult<()>
    where
        F: FnMut(SessionState) -> SessionResult<()> + Send,
    {
        bounded("connect", self.config.connect_timeout, self.platform.connect(id))
            .await
            .map_err(|e| connection_failed(id, e))?;

        advance(SessionState::ServiceDiscovery)?;
        let characteristics = bounded(
            "service discovery",
            self.config.discovery_timeout,
            self.platform.discover_services(id),
        )
        .await
        .map_err(|e| connection_failed(id, e))?;
        verify_service(&characteristics)?;

        self.platform
            .subscribe(id, PH_READING_CHAR_UUID)
            .await
            .map_err(|e| connection_failed(id, SessionError::Platform(e)))?;
        debug!("Subscribed to pH notifications from {id}");

        advance(SessionState::Subscribed)
    }
}

/// Check that the pH service carries both characteristics.
fn verify_service(characteristics: &[DiscoveredCharacteristic]) -> SessionResult<()> {
    for required in [PH_READING_CHAR_UUID, CALIBRATION_CHAR_UUID] {
        let found = characteristics
            .iter()
            .any(|c| c.service == PH_SERVICE_UUID && c.uuid == required);
        if !found {
            return Err(SessionError::MissingCharacteristic(required));
        }
    }
    Ok(())
}

fn connection_failed(id: &DeviceId, error: SessionError) -> SessionError {
    match error {
        SessionError::Timeout { .. } => error,
        other => SessionError::ConnectionFailed {
            device_id: id.clone(),
            reason: other.to_string(),
        },
    }
}

/// Await a platform future with a time limit.
pub(crate) async fn bounded<T, F>(operation: &'static str, limit: Duration, future: F) -> SessionResult<T>
where
    F: std::future::Future<Output = PlatformResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout {
            operation,
            after: limit,
        }),
    }
}
