//! Connects cipher operations that need a proof of presence to whichever
//! UI surface can currently host the authorization ceremony.
//!
//! The broker holds at most one [`Presenter`]. The host registers the
//! foreground surface and removes it again when that surface goes away;
//! removal only takes effect when issued by the presenter that is actually
//! registered, so a surface going to the background cannot clear its
//! successor.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::keystore::{AuthToken, CryptoContext};
use crate::policy::{AuthenticatorKind, Authenticators};

// Error codes, numbered like the platform's biometric prompt.
pub const ERROR_HW_UNAVAILABLE: i32 = 1;
pub const ERROR_TIMEOUT: i32 = 3;
pub const ERROR_CANCELED: i32 = 5;
pub const ERROR_LOCKOUT: i32 = 7;
pub const ERROR_USER_CANCELED: i32 = 10;
pub const ERROR_NEGATIVE_BUTTON: i32 = 13;
/// A proof was delivered but the key store did not accept it.
pub const ERROR_PROOF_REJECTED: i32 = -1;

/// Text shown by the presenter while the ceremony runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptInfo {
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    /// Only shown when device credentials are not an option; otherwise the
    /// platform supplies its own fallback button.
    #[serde(default)]
    pub negative_button_text: Option<String>,
}

impl PromptInfo {
    /// Adjusts the prompt to the authenticators a key accepts.
    pub fn for_authenticators(&self, allowed: Authenticators) -> Self {
        let mut prompt = self.clone();
        if allowed.contains(Authenticators::DEVICE_CREDENTIAL) {
            prompt.negative_button_text = None;
        } else if prompt.negative_button_text.is_none() {
            prompt.negative_button_text = Some("Cancel".into());
        }
        prompt
    }
}

impl Default for PromptInfo {
    fn default() -> Self {
        Self {
            title: "Authorize key use".into(),
            subtitle: Some("Confirm it's you to continue".into()),
            negative_button_text: None,
        }
    }
}

/// A request for proof of presence.
#[derive(Debug)]
pub struct AuthorizationRequest {
    context: Option<CryptoContext>,
    allowed: Authenticators,
    prompt: PromptInfo,
}

impl AuthorizationRequest {
    pub fn new(
        context: Option<CryptoContext>,
        allowed: Authenticators,
        prompt: PromptInfo,
    ) -> Self {
        Self {
            context,
            allowed,
            prompt,
        }
    }

    /// The cipher context the proof must be bound to, if any.
    pub fn context(&self) -> Option<&CryptoContext> {
        self.context.as_ref()
    }

    /// Challenge of the bound context.
    pub fn challenge(&self) -> Option<u64> {
        self.context.as_ref().map(CryptoContext::challenge)
    }

    pub fn allowed_authenticators(&self) -> Authenticators {
        self.allowed
    }

    pub fn prompt(&self) -> &PromptInfo {
        &self.prompt
    }

    /// Builds the success outcome after the user authenticated with `kind`.
    /// The bound context travels back with the proof.
    pub fn approve(self, kind: AuthenticatorKind) -> AuthorizationOutcome {
        let token = AuthToken::new(kind, self.challenge());
        AuthorizationOutcome::Authorized {
            context: self.context,
            token,
        }
    }

    /// Builds a failure outcome.
    pub fn reject(self, code: i32, message: impl Into<String>) -> AuthorizationOutcome {
        AuthorizationOutcome::Rejected {
            code,
            message: message.into(),
        }
    }
}

/// What a presenter reports once the ceremony is over.
#[derive(Debug)]
pub enum AuthorizationOutcome {
    Authorized {
        context: Option<CryptoContext>,
        token: AuthToken,
    },
    Rejected {
        code: i32,
        message: String,
    },
}

/// A successful ceremony as seen by the requester.
#[derive(Debug)]
pub struct AuthorizationGrant {
    pub context: Option<CryptoContext>,
    pub token: AuthToken,
}

/// One-shot channel a presenter uses to report its outcome.
#[derive(Debug)]
pub struct AuthorizationReply {
    tx: oneshot::Sender<AuthorizationOutcome>,
}

impl AuthorizationReply {
    /// Delivers the outcome. Returns `false` when the requester has gone
    /// away in the meantime; the outcome, including any context, is dropped.
    pub fn resolve(self, outcome: AuthorizationOutcome) -> bool {
        match self.tx.send(outcome) {
            Ok(()) => true,
            Err(_discarded) => {
                debug!("authorization outcome discarded, requester went away");
                false
            }
        }
    }

    /// True when nobody is waiting for this reply anymore.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Result of a pre-flight availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Ready,
    NoHardware,
    HardwareUnavailable,
    NoneEnrolled,
    SecurityUpdateRequired,
    Unsupported,
    Unknown,
    /// No presenter is registered with the broker.
    NoPresenter,
}

/// A UI surface able to run the authorization ceremony.
pub trait Presenter: Send + Sync {
    /// Starts a ceremony. Must eventually resolve `reply` exactly once, or
    /// drop it, which the requester sees as a cancellation.
    fn authorize(&self, request: AuthorizationRequest, reply: AuthorizationReply);

    /// Whether a ceremony with `allowed` could currently succeed.
    fn availability(&self, _allowed: Authenticators) -> Availability {
        Availability::Unknown
    }
}

/// Single-slot presenter registry.
///
/// Create one per process and share it; registration changes are expected
/// to come from one UI thread at a time.
#[derive(Default)]
pub struct AuthorizationBroker {
    slot: RwLock<Option<Weak<dyn Presenter>>>,
    timeout: Option<Duration>,
}

impl AuthorizationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that gives up on a ceremony after `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            slot: RwLock::default(),
            timeout,
        }
    }

    /// Makes `presenter` the active one, replacing any other.
    pub fn register<P: Presenter + 'static>(&self, presenter: &Arc<P>) {
        let shared: Arc<dyn Presenter> = presenter.clone();
        self.register_shared(&shared);
    }

    /// [`AuthorizationBroker::register`] for a presenter already held as a
    /// trait object.
    pub fn register_shared(&self, presenter: &Arc<dyn Presenter>) {
        let weak = Arc::downgrade(presenter);
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(weak);
        debug!("presenter registered");
    }

    /// Clears the slot if `presenter` is the registered one.
    pub fn unregister<P: Presenter + 'static>(&self, presenter: &Arc<P>) {
        let shared: Arc<dyn Presenter> = presenter.clone();
        self.unregister_shared(&shared);
    }

    pub fn unregister_shared(&self, presenter: &Arc<dyn Presenter>) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let is_current = slot
            .as_ref()
            .is_some_and(|current| std::ptr::addr_eq(current.as_ptr(), Arc::as_ptr(presenter)));
        if is_current {
            *slot = None;
            debug!("presenter unregistered");
        } else {
            debug!("ignoring unregister from a presenter that is not current");
        }
    }

    /// The registered presenter, if it is still alive.
    fn current(&self) -> Option<Arc<dyn Presenter>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn has_presenter(&self) -> bool {
        self.current().is_some()
    }

    /// Asks the registered presenter whether `allowed` can be satisfied.
    pub fn can_authenticate(&self, allowed: Authenticators) -> Availability {
        self.current()
            .map_or(Availability::NoPresenter, |p| p.availability(allowed))
    }

    /// Forwards `request` to the registered presenter and waits for its
    /// outcome without blocking the executor.
    #[instrument(level = "debug", skip_all, fields(allowed = %request.allowed_authenticators()))]
    pub async fn request_authorization(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationGrant> {
        let presenter = self.current().ok_or(Error::NoPresenterAvailable)?;
        let (tx, rx) = oneshot::channel();

        debug!(bound = request.context.is_some(), "forwarding authorization request");
        presenter.authorize(request, AuthorizationReply { tx });
        drop(presenter);

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(?limit, "authorization ceremony timed out");
                    return Err(Error::authorization(
                        ERROR_TIMEOUT,
                        "authorization ceremony timed out",
                    ));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(AuthorizationOutcome::Authorized { context, token }) => {
                debug!(authenticator = %token.authenticator(), "authorization granted");
                Ok(AuthorizationGrant { context, token })
            }
            Ok(AuthorizationOutcome::Rejected { code, message }) => {
                debug!(code, %message, "authorization rejected");
                Err(Error::AuthorizationFailed { code, message })
            }
            Err(_) => Err(Error::authorization(
                ERROR_CANCELED,
                "presenter dropped the request",
            )),
        }
    }
}
