//! Interactive consent for elevated operations.
//!
//! The authorizer asks a [`ConsentPrompt`] before raising the caller's tier.
//! [`ConsentBroker`] parks each request under a short base62 id and hands a
//! [`ConsentNotice`] to the UI layer, which answers with
//! [`ConsentBroker::resolve`]. Unanswered requests expire and count as a
//! refusal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::policy::{Capability, PrivilegeTier};

/// Length of generated consent identifiers.
const CONSENT_ID_LEN: usize = 8;

/// Base62 alphabet used for consent IDs.
const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Default consent expiry.
pub const DEFAULT_CONSENT_EXPIRY: Duration = Duration::from_secs(120);

/// Pending notices buffered for the UI.
const NOTICE_BUFFER: usize = 16;

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    /// Capability being requested.
    pub capability: Capability,
    /// One-line description shown to the user.
    pub summary: String,
    /// Tier the caller will hold if approved.
    pub elevates_to: PrivilegeTier,
}

/// The user's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    /// Approved.
    Approved,
    /// Explicitly refused.
    Denied,
    /// No answer before expiry.
    Expired,
}

impl ConsentDecision {
    /// Whether the decision permits the operation.
    pub fn approved(self) -> bool {
        self == Self::Approved
    }
}

/// Something that can ask the user for consent.
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// Ask the user and wait for an answer.
    async fn request(&self, request: ConsentRequest) -> ConsentDecision;
}

// ---------------------------------------------------------------------------
// Static consent
// ---------------------------------------------------------------------------

/// Fixed-answer consent, used for `--yes` and in tests.
#[derive(Debug)]
pub struct StaticConsent {
    approve: AtomicBool,
    prompts: AtomicUsize,
    asked: Mutex<Vec<Capability>>,
}

impl StaticConsent {
    /// Approve every request.
    pub fn approve_all() -> Self {
        Self {
            approve: AtomicBool::new(true),
            prompts: AtomicUsize::new(0),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Refuse every request.
    pub fn deny_all() -> Self {
        Self {
            approve: AtomicBool::new(false),
            prompts: AtomicUsize::new(0),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Change the answer given to later requests.
    pub fn set_approve(&self, approve: bool) {
        self.approve.store(approve, Ordering::SeqCst);
    }

    /// How many times consent was asked for.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// Capabilities consent was asked for, in order.
    pub fn asked_for(&self) -> Vec<Capability> {
        self.asked.lock().map(|asked| asked.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConsentPrompt for StaticConsent {
    async fn request(&self, request: ConsentRequest) -> ConsentDecision {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(request.capability);
        }
        let approve = self.approve.load(Ordering::SeqCst);
        debug!(capability = %request.capability, approve, "static consent");
        if approve {
            ConsentDecision::Approved
        } else {
            ConsentDecision::Denied
        }
    }
}

// ---------------------------------------------------------------------------
// Consent broker
// ---------------------------------------------------------------------------

/// Notice handed to the UI for each pending request.
#[derive(Debug, Clone)]
pub struct ConsentNotice {
    /// Short base62 identifier to answer with.
    pub id: String,
    /// The request.
    pub request: ConsentRequest,
    /// When the request stops accepting answers.
    pub expires_at: DateTime<Utc>,
}

/// Result of answering a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentResolution {
    /// The answer was delivered.
    Resolved,
    /// The request expired before the answer arrived.
    Expired,
    /// No pending request has this id.
    NotFound,
}

struct PendingConsent {
    expires_at: DateTime<Utc>,
    responder: oneshot::Sender<bool>,
}

/// Pending-request table bridging the authorizer and an interactive UI.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
pub struct ConsentBroker {
    pending: Mutex<HashMap<String, PendingConsent>>,
    notices: mpsc::Sender<ConsentNotice>,
    expiry: Duration,
}

impl ConsentBroker {
    /// Create a broker and the receiver the UI reads notices from.
    pub fn new(expiry: Duration) -> (Self, mpsc::Receiver<ConsentNotice>) {
        let (tx, rx) = mpsc::channel(NOTICE_BUFFER);
        (
            Self {
                pending: Mutex::new(HashMap::new()),
                notices: tx,
                expiry,
            },
            rx,
        )
    }

    /// Answer a pending request. Entries are single-use.
    pub fn resolve(&self, id: &str, approved: bool) -> ConsentResolution {
        let entry = match self.pending.lock() {
            Ok(mut map) => map.remove(id),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            return ConsentResolution::NotFound;
        };
        if Utc::now() > entry.expires_at {
            return ConsentResolution::Expired;
        }
        match entry.responder.send(approved) {
            Ok(()) => ConsentResolution::Resolved,
            // Requester gave up (timed out or was cancelled).
            Err(_) => ConsentResolution::Expired,
        }
    }

    /// Number of requests waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Drop expired entries; their requesters observe [`ConsentDecision::Expired`].
    pub fn gc_expired(&self) {
        if let Ok(mut map) = self.pending.lock() {
            let now = Utc::now();
            map.retain(|_, v| v.expires_at > now);
        }
    }

    fn remove(&self, id: &str) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(id);
        }
    }
}

#[async_trait]
impl ConsentPrompt for ConsentBroker {
    async fn request(&self, request: ConsentRequest) -> ConsentDecision {
        let id = generate_base62_id();
        let now = Utc::now();
        let offset = chrono::Duration::from_std(self.expiry).unwrap_or(chrono::Duration::zero());
        let expires_at = now.checked_add_signed(offset).unwrap_or(now);
        let (tx, rx) = oneshot::channel();

        if let Ok(mut map) = self.pending.lock() {
            map.insert(
                id.clone(),
                PendingConsent {
                    expires_at,
                    responder: tx,
                },
            );
        }

        let notice = ConsentNotice {
            id: id.clone(),
            request,
            expires_at,
        };
        if self.notices.send(notice).await.is_err() {
            // Nobody is listening, so nobody can approve.
            self.remove(&id);
            info!(consent_id = %id, "consent UI unavailable, refusing");
            return ConsentDecision::Denied;
        }

        let decision = match tokio::time::timeout(self.expiry, rx).await {
            Ok(Ok(true)) => ConsentDecision::Approved,
            Ok(Ok(false)) => ConsentDecision::Denied,
            Ok(Err(_)) | Err(_) => ConsentDecision::Expired,
        };
        self.remove(&id);
        debug!(consent_id = %id, ?decision, "consent answered");
        decision
    }
}

/// Generate an 8-character base62 identifier.
fn generate_base62_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CONSENT_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BASE62_CHARS.len());
            char::from(BASE62_CHARS[idx])
        })
        .collect()
}
