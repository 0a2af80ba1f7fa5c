//! The capability worker.
//!
//! Key restriction and access generation run on a dedicated OS thread. The
//! caller talks to it exclusively through typed request/response messages:
//! each [`WorkerRequest`] is answered by exactly one [`WorkerReply`], and a
//! new request is only sent once the previous one has been answered.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_core::{Passphrase, Salt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api_key::ApiKey;
use crate::caveat::Caveat;
use crate::error::{AccessError, AccessResult};
use crate::grant::{AccessGrant, EncryptionKey};

/// Reply string for a successful setup.
pub const CONFIGURED: &str = "configured";

/// A message sent to the worker.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Initialize the worker.
    Setup,
    /// Restrict an API key with a caveat.
    #[serde(rename_all = "camelCase")]
    SetPermission {
        /// Allow downloads.
        is_download: bool,
        /// Allow uploads.
        is_upload: bool,
        /// Allow listing.
        is_list: bool,
        /// Allow deletes.
        is_delete: bool,
        /// Optional start of the validity window.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_before: Option<DateTime<Utc>>,
        /// End of the validity window.
        not_after: DateTime<Utc>,
        /// Bucket allow-list; empty for all buckets.
        #[serde(default)]
        buckets: Vec<String>,
        /// Serialized key to restrict.
        api_key: String,
    },
    /// Build an access string from a restricted key.
    #[serde(rename_all = "camelCase")]
    GenerateAccess {
        /// Serialized restricted key.
        api_key: String,
        /// Encryption passphrase.
        passphrase: Passphrase,
        /// Base64 project salt.
        salt: Salt,
        /// Satellite node address.
        #[serde(rename = "satelliteNodeURL")]
        satellite_node_url: String,
    },
}

impl WorkerRequest {
    /// Build a `SetPermission` request from a caveat.
    #[must_use]
    pub fn set_permission(api_key: &str, caveat: &Caveat, not_after: DateTime<Utc>) -> Self {
        Self::SetPermission {
            is_download: caveat.allow_download,
            is_upload: caveat.allow_upload,
            is_list: caveat.allow_list,
            is_delete: caveat.allow_delete,
            not_before: caveat.not_before,
            not_after,
            buckets: caveat.buckets.clone(),
            api_key: api_key.to_owned(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Setup => "Setup",
            Self::SetPermission { .. } => "SetPermission",
            Self::GenerateAccess { .. } => "GenerateAccess",
        }
    }
}

impl fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRequest")
            .field("type", &self.name())
            .finish_non_exhaustive()
    }
}

/// The worker's answer to one request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerReply {
    /// Plain status string; `"configured"` after setup.
    Status(String),
    /// A derived value (restricted key or access string).
    Value {
        /// The derived value.
        value: String,
    },
    /// The request failed.
    Error {
        /// Error description.
        error: String,
    },
}

impl fmt::Debug for WorkerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => f.debug_tuple("Status").field(status).finish(),
            Self::Value { .. } => f.write_str("Value(<redacted>)"),
            Self::Error { error } => f.debug_struct("Error").field("error", error).finish(),
        }
    }
}

struct Envelope {
    request: WorkerRequest,
    reply: oneshot::Sender<WorkerReply>,
}

/// Handle to the capability worker thread.
///
/// The worker must be [`start`](Self::start)ed and [`setup`](Self::setup)
/// before it derives anything; until then derivation requests fail with
/// [`AccessError::WorkerUnavailable`].
pub struct CapabilityWorker {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    ready: AtomicBool,
}

impl fmt::Debug for CapabilityWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityWorker")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl Default for CapabilityWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityWorker {
    /// Create a handle with no running worker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Start the worker thread and set it up.
    pub async fn spawn() -> AccessResult<Self> {
        let worker = Self::new();
        worker.start().await?;
        worker.setup().await?;
        Ok(worker)
    }

    /// Start the worker thread. Replaces any previous worker.
    pub async fn start(&self) -> AccessResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("capability-worker".to_owned())
            .spawn(move || run(rx))
            .map_err(|e| AccessError::SetupFailed(e.to_string()))?;

        *self.sender.lock().await = Some(tx);
        self.ready.store(false, Ordering::SeqCst);
        debug!("capability worker thread started");
        Ok(())
    }

    /// Initialize the worker; required before any derivation.
    pub async fn setup(&self) -> AccessResult<()> {
        match self.call(WorkerRequest::Setup).await? {
            WorkerReply::Status(status) if status == CONFIGURED => {
                self.ready.store(true, Ordering::SeqCst);
                info!("capability worker configured");
                Ok(())
            }
            WorkerReply::Error { error } => Err(AccessError::SetupFailed(error)),
            other => Err(AccessError::SetupFailed(format!(
                "unexpected setup reply: {other:?}"
            ))),
        }
    }

    /// Whether the worker has been set up and its thread is alive.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Restrict `api_key` with `caveat`, returning the serialized restricted key.
    pub async fn set_permission(&self, api_key: &str, caveat: &Caveat) -> AccessResult<String> {
        let not_after = caveat.not_after.ok_or_else(|| {
            AccessError::DerivationFailed("caveat must carry a notAfter bound".to_owned())
        })?;
        self.derive(WorkerRequest::set_permission(api_key, caveat, not_after))
            .await
    }

    /// Build an access string for a restricted key.
    pub async fn generate_access(
        &self,
        api_key: &str,
        passphrase: &Passphrase,
        salt: &Salt,
        satellite_node_url: &str,
    ) -> AccessResult<String> {
        self.derive(WorkerRequest::GenerateAccess {
            api_key: api_key.to_owned(),
            passphrase: passphrase.clone(),
            salt: salt.clone(),
            satellite_node_url: satellite_node_url.to_owned(),
        })
        .await
    }

    async fn derive(&self, request: WorkerRequest) -> AccessResult<String> {
        if !self.is_ready() {
            return Err(AccessError::WorkerUnavailable);
        }
        match self.call(request).await? {
            WorkerReply::Value { value } => Ok(value),
            WorkerReply::Error { error } => Err(AccessError::DerivationFailed(error)),
            WorkerReply::Status(status) => Err(AccessError::DerivationFailed(format!(
                "unexpected worker status: {status}"
            ))),
        }
    }

    /// Send one request and wait for its reply. The lock is held across the
    /// round trip so at most one request is outstanding.
    async fn call(&self, request: WorkerRequest) -> AccessResult<WorkerReply> {
        let guard = self.sender.lock().await;
        let Some(sender) = guard.as_ref() else {
            return Err(AccessError::WorkerUnavailable);
        };

        let kind = request.name();
        let (reply_tx, reply_rx) = oneshot::channel();
        if sender
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            self.ready.store(false, Ordering::SeqCst);
            return Err(AccessError::WorkerUnavailable);
        }

        match reply_rx.await {
            Ok(reply) => {
                debug!(request = kind, "capability worker replied");
                Ok(reply)
            }
            Err(_) => {
                warn!(request = kind, "capability worker dropped a request");
                self.ready.store(false, Ordering::SeqCst);
                Err(AccessError::WorkerUnavailable)
            }
        }
    }
}

/// Worker thread body. Exits when every sender is dropped.
fn run(mut requests: mpsc::UnboundedReceiver<Envelope>) {
    let mut configured = false;
    while let Some(Envelope { request, reply }) = requests.blocking_recv() {
        let answer = match request {
            WorkerRequest::Setup => {
                configured = true;
                WorkerReply::Status(CONFIGURED.to_owned())
            }
            _ if !configured => WorkerReply::Error {
                error: "worker is not configured".to_owned(),
            },
            request => match handle(request) {
                Ok(value) => WorkerReply::Value { value },
                Err(e) => WorkerReply::Error {
                    error: e.to_string(),
                },
            },
        };
        // The caller may have given up on the reply; nothing to do then.
        let _ = reply.send(answer);
    }
}

fn handle(request: WorkerRequest) -> AccessResult<String> {
    match request {
        WorkerRequest::Setup => Ok(CONFIGURED.to_owned()),
        WorkerRequest::SetPermission {
            is_download,
            is_upload,
            is_list,
            is_delete,
            not_before,
            not_after,
            buckets,
            api_key,
        } => {
            let key = ApiKey::parse(&api_key)?;
            let caveat = Caveat {
                allow_download: is_download,
                allow_upload: is_upload,
                allow_list: is_list,
                allow_delete: is_delete,
                not_before,
                not_after: Some(not_after),
                buckets,
            };
            caveat.validate(Utc::now())?;
            Ok(key.restrict(caveat)?.serialize())
        }
        WorkerRequest::GenerateAccess {
            api_key,
            passphrase,
            salt,
            satellite_node_url,
        } => {
            let key = ApiKey::parse(&api_key)?;
            let salt = salt
                .decode()
                .map_err(|e| AccessError::DerivationFailed(e.to_string()))?;
            let encryption_key = EncryptionKey::derive(&passphrase, &salt)?;
            AccessGrant::new(satellite_node_url, key, encryption_key).serialize()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::caveat::Action;

    const SECRET: &[u8] = b"root-secret";

    #[tokio::test]
    async fn test_should_fail_before_start() {
        let worker = CapabilityWorker::new();
        assert!(!worker.is_ready());
        assert!(matches!(
            worker.setup().await,
            Err(AccessError::WorkerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_should_reject_derivation_before_setup() {
        let worker = CapabilityWorker::new();
        worker.start().await.unwrap();
        let key = ApiKey::mint(SECRET).serialize();
        let caveat = Caveat::full_access(Utc::now() + Duration::days(3));
        assert!(matches!(
            worker.set_permission(&key, &caveat).await,
            Err(AccessError::WorkerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_should_restrict_key_with_caveat() {
        let worker = CapabilityWorker::spawn().await.unwrap();
        let key = ApiKey::mint(SECRET).serialize();
        let now = Utc::now();
        let mut caveat = Caveat::full_access(now + Duration::days(3));
        caveat.allow_upload = false;

        let restricted = worker.set_permission(&key, &caveat).await.unwrap();
        let restricted = ApiKey::parse(&restricted).unwrap();
        assert!(restricted.verify(SECRET));
        assert!(restricted.allows(Action::Read, "b", now));
        assert!(!restricted.allows(Action::Write, "b", now));
    }

    #[tokio::test]
    async fn test_should_fail_on_expired_caveat() {
        let worker = CapabilityWorker::spawn().await.unwrap();
        let key = ApiKey::mint(SECRET).serialize();
        let caveat = Caveat::full_access(Utc::now() - Duration::minutes(1));
        assert!(matches!(
            worker.set_permission(&key, &caveat).await,
            Err(AccessError::DerivationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_should_fail_on_malformed_key() {
        let worker = CapabilityWorker::spawn().await.unwrap();
        let caveat = Caveat::full_access(Utc::now() + Duration::days(1));
        assert!(matches!(
            worker.set_permission("garbage", &caveat).await,
            Err(AccessError::DerivationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_should_generate_parseable_access() {
        let worker = CapabilityWorker::spawn().await.unwrap();
        let key = ApiKey::mint(SECRET).serialize();
        let access = worker
            .generate_access(
                &key,
                &Passphrase::new("pw"),
                &Salt::from_bytes(b"salt"),
                "sat.example.test:7777",
            )
            .await
            .unwrap();

        let grant = AccessGrant::parse(&access).unwrap();
        assert_eq!(grant.satellite_address(), "sat.example.test:7777");
        assert!(grant.api_key().verify(SECRET));
    }

    #[tokio::test]
    async fn test_should_answer_sequential_requests_in_order() {
        let worker = CapabilityWorker::spawn().await.unwrap();
        let key = ApiKey::mint(SECRET).serialize();
        let caveat = Caveat::full_access(Utc::now() + Duration::days(1));
        for _ in 0..5 {
            let restricted = worker.set_permission(&key, &caveat).await.unwrap();
            assert_eq!(ApiKey::parse(&restricted).unwrap().caveats().len(), 1);
        }
    }

    #[test]
    fn test_should_serialize_protocol_messages() {
        let setup = serde_json::to_value(WorkerRequest::Setup).unwrap();
        assert_eq!(setup, serde_json::json!({ "type": "Setup" }));

        let caveat = Caveat::full_access(Utc::now() + Duration::days(3));
        let not_after = caveat.not_after.unwrap();
        let request = WorkerRequest::set_permission("key", &caveat, not_after);
        let json = serde_json::to_value(request).unwrap();
        assert_eq!(json["type"], "SetPermission");
        assert_eq!(json["isDownload"], true);
        assert_eq!(json["apiKey"], "key");
        assert!(json["notAfter"].is_string());

        let generate = WorkerRequest::GenerateAccess {
            api_key: "key".to_owned(),
            passphrase: Passphrase::new("pw"),
            salt: Salt::new("c2FsdA=="),
            satellite_node_url: "sat:7777".to_owned(),
        };
        let json = serde_json::to_value(generate).unwrap();
        assert_eq!(json["satelliteNodeURL"], "sat:7777");
        assert_eq!(json["salt"], "c2FsdA==");
    }

    #[test]
    fn test_should_parse_protocol_replies() {
        let configured: WorkerReply = serde_json::from_str("\"configured\"").unwrap();
        assert_eq!(configured, WorkerReply::Status(CONFIGURED.to_owned()));

        let value: WorkerReply = serde_json::from_str(r#"{"value":"abc"}"#).unwrap();
        assert_eq!(
            value,
            WorkerReply::Value {
                value: "abc".to_owned()
            }
        );

        let error: WorkerReply = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert!(matches!(error, WorkerReply::Error { .. }));
    }

    #[test]
    fn test_should_not_print_passphrase_in_debug() {
        let request = WorkerRequest::GenerateAccess {
            api_key: "key".to_owned(),
            passphrase: Passphrase::new("super secret"),
            salt: Salt::new("c2FsdA=="),
            satellite_node_url: "sat:7777".to_owned(),
        };
        assert!(!format!("{request:?}").contains("super secret"));
    }
}
