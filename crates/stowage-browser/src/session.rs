//! Session state machine.
//!
//! [`SessionManager::open_session`] walks a project from nothing to a usable
//! object store client:
//!
//! ```text
//! Empty -> ApiKeyEnsured -> GrantRequested -> CredentialExchanged -> ClientReady
//! ```
//!
//! Any failure returns the manager to [`SessionState::Empty`] and clears the
//! browse session, so no half-built credential or client is ever observable.
//! Delete and create sessions skip derivation and only install a client for
//! a credential obtained elsewhere.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use stowage_access::{Caveat, CapabilityWorker, CredentialExchange, GatewayCredential, ProjectApi};
use stowage_core::{Passphrase, ProjectId, StowageConfig};
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, ClientSlot};
use crate::config::BrowserConfig;
use crate::error::{BrowserError, BrowserResult};
use crate::store::ObjectStore;

/// Progress of [`SessionManager::open_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing derived.
    #[default]
    Empty,
    /// A project API key is bound.
    ApiKeyEnsured,
    /// A restricted grant was requested from the worker.
    GrantRequested,
    /// Gateway credentials were obtained.
    CredentialExchanged,
    /// A client is installed on the browse session.
    ClientReady,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One gateway credential and the client built for it.
///
/// Cloning shares the same slot, so engines holding a clone observe client
/// rotation.
#[derive(Clone, Default)]
pub struct Session {
    credential: Arc<RwLock<Option<GatewayCredential>>>,
    slot: ClientSlot,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credential", &*self.credential.read())
            .field("slot", &self.slot)
            .finish()
    }
}

impl Session {
    /// An empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `client`, built for `credential`, replacing any previous one.
    pub fn install(&self, credential: GatewayCredential, client: Arc<dyn ObjectStore>) {
        *self.credential.write() = Some(credential);
        self.slot.replace(client);
    }

    /// Snapshot of the current client.
    pub fn client(&self) -> BrowserResult<Arc<dyn ObjectStore>> {
        self.slot.get()
    }

    /// The slot engines should hold on to.
    #[must_use]
    pub fn slot(&self) -> ClientSlot {
        self.slot.clone()
    }

    /// The credential the current client was built for.
    #[must_use]
    pub fn credential(&self) -> Option<GatewayCredential> {
        self.credential.read().clone()
    }

    /// Drop the credential and client.
    pub fn clear(&self) {
        *self.credential.write() = None;
        self.slot.clear();
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BoundKey {
    project: ProjectId,
    serialized: String,
}

/// Opens browse, delete, and create sessions.
pub struct SessionManager {
    project_api: Arc<dyn ProjectApi>,
    worker: Arc<CapabilityWorker>,
    exchange: Arc<dyn CredentialExchange>,
    factory: Arc<dyn ClientFactory>,
    config: StowageConfig,
    browser_config: BrowserConfig,
    // Serializes session opening; holds the bound API key.
    binding: tokio::sync::Mutex<Option<BoundKey>>,
    state: Mutex<SessionState>,
    browse: Session,
    delete: Session,
    create: Session,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("browse", &self.browse)
            .field("delete", &self.delete)
            .field("create", &self.create)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over its collaborators.
    #[must_use]
    pub fn new(
        project_api: Arc<dyn ProjectApi>,
        worker: Arc<CapabilityWorker>,
        exchange: Arc<dyn CredentialExchange>,
        factory: Arc<dyn ClientFactory>,
        config: StowageConfig,
        browser_config: BrowserConfig,
    ) -> Self {
        Self {
            project_api,
            worker,
            exchange,
            factory,
            config,
            browser_config,
            binding: tokio::sync::Mutex::new(None),
            state: Mutex::new(SessionState::Empty),
            browse: Session::new(),
            delete: Session::new(),
            create: Session::new(),
        }
    }

    /// Current state of the browse session.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The browse session.
    #[must_use]
    pub fn browse_session(&self) -> &Session {
        &self.browse
    }

    /// The session used for deletions.
    #[must_use]
    pub fn delete_session(&self) -> &Session {
        &self.delete
    }

    /// The session used for bucket creation.
    #[must_use]
    pub fn create_session(&self) -> &Session {
        &self.create
    }

    /// Derive scoped credentials for `project` and install a browse client.
    pub async fn open_session(&self, project: ProjectId, passphrase: &Passphrase) -> BrowserResult<()> {
        self.open_session_for_buckets(project, passphrase, Vec::new())
            .await
    }

    /// Like [`open_session`](Self::open_session), with the grant limited to
    /// `buckets` (empty means every bucket).
    pub async fn open_session_for_buckets(
        &self,
        project: ProjectId,
        passphrase: &Passphrase,
        buckets: Vec<String>,
    ) -> BrowserResult<()> {
        let mut binding = self.binding.lock().await;
        match self
            .derive_and_install(&mut binding, project, passphrase, buckets)
            .await
        {
            Ok(()) => {
                self.transition(SessionState::ClientReady);
                info!(project = %project, "object browser session ready");
                Ok(())
            }
            Err(e) => {
                warn!(project = %project, error = %e, "failed to open object browser session");
                *binding = None;
                self.browse.clear();
                self.transition(SessionState::Empty);
                Err(e)
            }
        }
    }

    async fn derive_and_install(
        &self,
        binding: &mut Option<BoundKey>,
        project: ProjectId,
        passphrase: &Passphrase,
        buckets: Vec<String>,
    ) -> BrowserResult<()> {
        let api_key = self.ensure_api_key(binding, project).await?;
        self.transition(SessionState::ApiKeyEnsured);

        if !self.worker.is_ready() {
            return Err(BrowserError::WorkerUnavailable);
        }

        self.transition(SessionState::GrantRequested);
        let caveat = Caveat {
            buckets,
            ..Caveat::full_access(Utc::now() + self.browser_config.grant_lifetime())
        };
        let restricted = self.worker.set_permission(&api_key, &caveat).await?;

        if passphrase.is_empty() {
            return Err(BrowserError::EmptyPassphrase);
        }

        let salt = self.project_api.project_salt(project).await?;
        let access = self
            .worker
            .generate_access(
                &restricted,
                passphrase,
                &salt,
                self.project_api.satellite_node_url(),
            )
            .await?;

        let credential = self
            .exchange
            .exchange(&access, self.config.public_grants)
            .await?;
        self.transition(SessionState::CredentialExchanged);

        install(self.factory.as_ref(), &self.browse, credential)
    }

    /// Reuse the bound key for `project`, or replace any stale key with the
    /// well-known name by a fresh one.
    async fn ensure_api_key(
        &self,
        binding: &mut Option<BoundKey>,
        project: ProjectId,
    ) -> BrowserResult<String> {
        if let Some(bound) = binding.as_ref().filter(|b| b.project == project) {
            debug!(project = %project, "reusing bound API key");
            return Ok(bound.serialized.clone());
        }

        let name = self.config.key_name.as_str();
        self.project_api
            .delete_api_key_by_name(project, name)
            .await?;
        let serialized = self.project_api.create_api_key(project, name).await?;
        debug!(project = %project, name, "created object browser API key");

        *binding = Some(BoundKey {
            project,
            serialized: serialized.clone(),
        });
        Ok(serialized)
    }

    /// Install a client for an already-derived credential on the delete session.
    pub fn open_delete_session(&self, credential: GatewayCredential) -> BrowserResult<()> {
        install(self.factory.as_ref(), &self.delete, credential)
    }

    /// Install a client for an already-derived credential on the create session.
    pub fn open_create_session(&self, credential: GatewayCredential) -> BrowserResult<()> {
        install(self.factory.as_ref(), &self.create, credential)
    }

    /// Forget the bound key and every session.
    pub async fn clear(&self) {
        let mut binding = self.binding.lock().await;
        *binding = None;
        self.browse.clear();
        self.delete.clear();
        self.create.clear();
        self.transition(SessionState::Empty);
        debug!("object browser sessions cleared");
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "session state transition");
            *state = next;
        }
    }
}

fn install(
    factory: &dyn ClientFactory,
    session: &Session,
    credential: GatewayCredential,
) -> BrowserResult<()> {
    let client = factory.build(&credential)?;
    debug!(access_key_id = %credential.access_key_id, endpoint = %credential.endpoint, "installed object store client");
    session.install(credential, client);
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use stowage_access::MemoryProjectApi;

    use super::*;
    use crate::store::memory::MemoryGateway;

    const ROOT: &[u8] = b"project-root-secret";

    struct Fixture {
        manager: SessionManager,
        projects: Arc<MemoryProjectApi>,
        gateway: MemoryGateway,
    }

    fn fixture(worker: CapabilityWorker) -> Fixture {
        let projects = Arc::new(MemoryProjectApi::new(ROOT.to_vec(), "sat:7777"));
        let gateway = MemoryGateway::new().with_root_secret(ROOT);
        gateway.create_bucket("photos", false);
        let manager = SessionManager::new(
            projects.clone(),
            Arc::new(worker),
            Arc::new(gateway.clone()),
            Arc::new(gateway.clone()),
            StowageConfig::default(),
            BrowserConfig::default(),
        );
        Fixture {
            manager,
            projects,
            gateway,
        }
    }

    async fn ready_fixture() -> Fixture {
        fixture(CapabilityWorker::spawn().await.unwrap())
    }

    fn passphrase() -> Passphrase {
        Passphrase::new("correct horse battery staple")
    }

    #[tokio::test]
    async fn test_should_open_session_with_working_client() {
        let f = ready_fixture().await;
        let project = ProjectId::new_random();

        f.manager.open_session(project, &passphrase()).await.unwrap();
        assert_eq!(f.manager.state(), SessionState::ClientReady);

        let client = f.manager.browse_session().client().unwrap();
        client
            .put_object("photos", "cat.jpg", Bytes::from_static(b"meow"))
            .await
            .unwrap();
        assert!(f.gateway.contains("photos", "cat.jpg"));
        assert_eq!(f.gateway.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_should_leave_one_api_key_after_repeated_open() {
        let f = ready_fixture().await;
        let project = ProjectId::new_random();
        let name = StowageConfig::default().key_name;

        f.manager.open_session(project, &passphrase()).await.unwrap();
        f.manager.open_session(project, &passphrase()).await.unwrap();
        assert_eq!(f.projects.live_keys(project, &name), 1);

        // A fresh manager replaces the stale key instead of adding one.
        let second = SessionManager::new(
            f.projects.clone(),
            Arc::new(CapabilityWorker::spawn().await.unwrap()),
            Arc::new(f.gateway.clone()),
            Arc::new(f.gateway.clone()),
            StowageConfig::default(),
            BrowserConfig::default(),
        );
        second.open_session(project, &passphrase()).await.unwrap();
        assert_eq!(f.projects.live_keys(project, &name), 1);
    }

    #[tokio::test]
    async fn test_should_fail_when_worker_not_ready() {
        let f = fixture(CapabilityWorker::new());
        let err = f
            .manager
            .open_session(ProjectId::new_random(), &passphrase())
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::WorkerUnavailable));
        assert_eq!(f.manager.state(), SessionState::Empty);
        assert!(matches!(
            f.manager.browse_session().client(),
            Err(BrowserError::UninitializedClient)
        ));
    }

    #[tokio::test]
    async fn test_should_reject_empty_passphrase() {
        let f = ready_fixture().await;
        let err = f
            .manager
            .open_session(ProjectId::new_random(), &Passphrase::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::EmptyPassphrase));
        assert_eq!(f.manager.state(), SessionState::Empty);
        assert_eq!(f.gateway.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_should_reset_to_empty_on_exchange_failure() {
        let f = ready_fixture().await;
        let project = ProjectId::new_random();
        f.manager.open_session(project, &passphrase()).await.unwrap();

        f.gateway.fail_exchanges(Some("gateway unavailable"));
        let err = f
            .manager
            .open_session(project, &passphrase())
            .await
            .unwrap_err();
        match err {
            BrowserError::ExchangeFailed { status, message } => {
                assert_eq!(status, Some(500));
                assert_eq!(message, "gateway unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.manager.state(), SessionState::Empty);
        assert!(f.manager.browse_session().credential().is_none());

        f.gateway.fail_exchanges(None);
        f.manager.open_session(project, &passphrase()).await.unwrap();
        let name = StowageConfig::default().key_name;
        assert_eq!(f.projects.live_keys(project, &name), 1);
    }

    #[tokio::test]
    async fn test_should_scope_grant_to_allowed_buckets() {
        let f = ready_fixture().await;
        f.gateway.create_bucket("private", false);
        f.manager
            .open_session_for_buckets(
                ProjectId::new_random(),
                &passphrase(),
                vec!["photos".to_owned()],
            )
            .await
            .unwrap();

        let client = f.manager.browse_session().client().unwrap();
        client
            .put_object("photos", "ok", Bytes::from_static(b"1"))
            .await
            .unwrap();
        let err = client
            .put_object("private", "nope", Bytes::from_static(b"1"))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("AccessDenied"));
    }

    #[tokio::test]
    async fn test_should_open_delete_and_create_sessions_independently() {
        let f = ready_fixture().await;
        f.manager
            .open_session(ProjectId::new_random(), &passphrase())
            .await
            .unwrap();
        let credential = f.manager.browse_session().credential().unwrap();

        f.manager.open_delete_session(credential.clone()).unwrap();
        assert!(f.manager.delete_session().client().is_ok());
        assert!(f.manager.create_session().client().is_err());

        f.manager.open_create_session(credential).unwrap();
        let browse = f.manager.browse_session().client().unwrap();
        let delete = f.manager.delete_session().client().unwrap();
        assert!(!Arc::ptr_eq(&browse, &delete));

        f.manager.clear().await;
        assert_eq!(f.manager.state(), SessionState::Empty);
        assert!(f.manager.delete_session().client().is_err());
    }
}
