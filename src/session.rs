//! One encrypt or decrypt operation against a provisioned key.
//!
//! A [`PendingCipher`] moves through
//! `KeyBound → AuthorizationPending → Authorized → Finalized`, or ends in
//! `Failed`. The only suspension point is the wait for the broker in
//! [`PendingCipher::authorize`]; keys that need no proof, or whose last
//! proof is still fresh, go straight to `Authorized`.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::broker::{
    AuthorizationBroker, AuthorizationRequest, ERROR_CANCELED, ERROR_PROOF_REJECTED, PromptInfo,
};
use crate::envelope::{self, Nonce};
use crate::error::{Error, Result};
use crate::keystore::{Binding, CryptoContext, Direction, KeyAlias, KeyStoreProvider};
use crate::policy::Authenticators;
use crate::vault::KeyHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    KeyBound,
    AuthorizationPending,
    Authorized,
    Finalized,
    Failed,
}

/// Starts cipher operations against keys of one provider.
#[derive(Clone)]
pub struct CipherSession {
    provider: Arc<dyn KeyStoreProvider>,
    prompt: PromptInfo,
}

impl CipherSession {
    pub fn new(provider: Arc<dyn KeyStoreProvider>) -> Self {
        Self::with_prompt(provider, PromptInfo::default())
    }

    pub fn with_prompt(provider: Arc<dyn KeyStoreProvider>, prompt: PromptInfo) -> Self {
        Self { provider, prompt }
    }

    /// Binds a fresh encrypting context. The store picks the nonce.
    pub fn begin_encrypt(&self, handle: &KeyHandle) -> Result<PendingCipher> {
        self.begin(handle, Direction::Encrypt, None)
    }

    /// Binds a decrypting context for the nonce recovered from an envelope.
    pub fn begin_decrypt(&self, handle: &KeyHandle, nonce: &[u8]) -> Result<PendingCipher> {
        let nonce = envelope::nonce_from_slice(nonce)?;
        self.begin(handle, Direction::Decrypt, Some(nonce))
    }

    #[instrument(level = "debug", skip(self, handle, nonce), fields(alias = %handle.alias()))]
    fn begin(
        &self,
        handle: &KeyHandle,
        direction: Direction,
        nonce: Option<Nonce>,
    ) -> Result<PendingCipher> {
        let alias = handle.alias();
        let allowed = self.provider.policy(&alias)?.authenticators();
        let binding = self.provider.init_context(&alias, direction, nonce)?;
        trace!(ready = matches!(binding, Binding::Ready(_)), "context bound");

        Ok(PendingCipher {
            provider: self.provider.clone(),
            alias,
            direction,
            nonce,
            allowed,
            prompt: self.prompt.for_authenticators(allowed),
            state: SessionState::KeyBound,
            binding: Some(binding),
            context: None,
        })
    }
}

/// A cipher operation waiting to be authorized and run.
pub struct PendingCipher {
    provider: Arc<dyn KeyStoreProvider>,
    alias: KeyAlias,
    direction: Direction,
    nonce: Option<Nonce>,
    allowed: Authenticators,
    prompt: PromptInfo,
    state: SessionState,
    binding: Option<Binding>,
    context: Option<CryptoContext>,
}

impl PendingCipher {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether [`PendingCipher::authorize`] will have to ask for a proof.
    pub fn needs_authorization(&self) -> bool {
        matches!(self.binding, Some(Binding::NeedsAuthorization(_)))
    }

    /// Obtains an authorized context, suspending on the broker when the key
    /// needs a fresh proof.
    ///
    /// At most one authorization request is issued. If the caller drops the
    /// returned future while the ceremony is running, the operation stays
    /// unusable and its eventual outcome is discarded.
    #[instrument(level = "debug", skip_all, fields(alias = %self.alias, direction = ?self.direction))]
    pub async fn authorize(&mut self, broker: &AuthorizationBroker) -> Result<()> {
        match self.state {
            SessionState::KeyBound => {}
            SessionState::Authorized => return Ok(()),
            state => return Err(out_of_order(state)),
        }

        match self.acquire(broker).await {
            Ok(context) => {
                self.context = Some(context);
                self.state = SessionState::Authorized;
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "cipher session failed");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn acquire(&mut self, broker: &AuthorizationBroker) -> Result<CryptoContext> {
        let pending = match self.binding.take() {
            Some(Binding::Ready(context)) => return Ok(context),
            Some(Binding::NeedsAuthorization(pending)) => pending,
            None => return Err(out_of_order(self.state)),
        };

        self.state = SessionState::AuthorizationPending;
        debug!(bound = pending.is_some(), "suspending for authorization");
        let request = AuthorizationRequest::new(pending, self.allowed, self.prompt.clone());
        let grant = broker.request_authorization(request).await?;

        match self.provider.apply_authorization(
            &self.alias,
            self.direction,
            self.nonce,
            grant.context,
            &grant.token,
        )? {
            Binding::Ready(context) => {
                debug!("resuming with authorized context");
                Ok(context)
            }
            Binding::NeedsAuthorization(_) => Err(Error::authorization(
                ERROR_PROOF_REJECTED,
                "key still requires authorization after a successful proof",
            )),
        }
    }

    /// Runs the transform. Encryption returns an envelope, decryption the
    /// plaintext.
    pub fn finish(mut self, data: &[u8]) -> Result<Vec<u8>> {
        let context = match (self.state, self.context.take()) {
            (SessionState::Authorized, Some(context)) => context,
            (state, _) => return Err(out_of_order(state)),
        };
        let nonce = *context.nonce();
        let output = context.apply(data);
        self.state = SessionState::Finalized;
        trace!(ok = output.is_ok(), "cipher session finalized");

        match self.direction {
            Direction::Encrypt => output.map(|ciphertext| envelope::pack(&nonce, &ciphertext)),
            Direction::Decrypt => output,
        }
    }
}

fn out_of_order(state: SessionState) -> Error {
    Error::authorization(
        ERROR_CANCELED,
        format!("cipher session is not authorized (state {state:?})"),
    )
}

impl fmt::Debug for PendingCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCipher")
            .field("alias", &self.alias)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AuthorizationReply, Presenter};
    use crate::kv::SledKeyStore;
    use crate::policy::{AuthenticatorKind, KeyPolicy};
    use crate::vault::KeyVault;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Counting {
        requests: AtomicUsize,
        bound: AtomicUsize,
    }

    impl Presenter for Counting {
        fn authorize(&self, request: AuthorizationRequest, reply: AuthorizationReply) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if request.context().is_some() {
                self.bound.fetch_add(1, Ordering::SeqCst);
            }
            reply.resolve(request.approve(AuthenticatorKind::StrongBiometric));
        }
    }

    #[derive(Default)]
    struct Holding {
        pending: Mutex<Vec<(AuthorizationRequest, AuthorizationReply)>>,
    }

    impl Presenter for Holding {
        fn authorize(&self, request: AuthorizationRequest, reply: AuthorizationReply) {
            self.pending.lock().unwrap().push((request, reply));
        }
    }

    fn setup(policy: KeyPolicy) -> (CipherSession, KeyHandle) {
        let provider: Arc<dyn KeyStoreProvider> = Arc::new(SledKeyStore::temporary().unwrap());
        let vault = KeyVault::new(provider.clone());
        let handle = vault.provision(&policy).unwrap();
        (CipherSession::new(provider), handle)
    }

    async fn roundtrip(
        session: &CipherSession,
        handle: &KeyHandle,
        broker: &AuthorizationBroker,
        plaintext: &[u8],
    ) -> Vec<u8> {
        let mut enc = session.begin_encrypt(handle).unwrap();
        enc.authorize(broker).await.unwrap();
        let envelope = enc.finish(plaintext).unwrap();

        let (nonce, ciphertext) = envelope::unpack(&envelope).unwrap();
        let mut dec = session.begin_decrypt(handle, &nonce).unwrap();
        dec.authorize(broker).await.unwrap();
        dec.finish(ciphertext).unwrap()
    }

    #[tokio::test]
    async fn unrestricted_key_never_suspends() {
        let (session, handle) = setup(KeyPolicy::unrestricted());
        let broker = AuthorizationBroker::new();

        let mut enc = session.begin_encrypt(&handle).unwrap();
        assert_eq!(enc.state(), SessionState::KeyBound);
        assert!(!enc.needs_authorization());
        enc.authorize(&broker).await.unwrap();
        assert_eq!(enc.state(), SessionState::Authorized);

        assert_eq!(roundtrip(&session, &handle, &broker, b"plain").await, b"plain");
    }

    #[tokio::test]
    async fn per_use_key_issues_one_bound_request_per_operation() {
        let (session, handle) =
            setup(KeyPolicy::per_use(Authenticators::BIOMETRIC_STRONG).unwrap());
        let broker = AuthorizationBroker::new();
        let presenter = Arc::new(Counting::default());
        broker.register(&presenter);

        assert_eq!(roundtrip(&session, &handle, &broker, b"secret").await, b"secret");
        assert_eq!(presenter.requests.load(Ordering::SeqCst), 2);
        assert_eq!(presenter.bound.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn lapsed_window_recreates_context_after_proof() {
        let (session, handle) = setup(
            KeyPolicy::timed(Duration::from_secs(300), Authenticators::BIOMETRIC_STRONG).unwrap(),
        );
        let broker = AuthorizationBroker::new();
        let presenter = Arc::new(Counting::default());
        broker.register(&presenter);

        let mut enc = session.begin_encrypt(&handle).unwrap();
        assert!(enc.needs_authorization());
        enc.authorize(&broker).await.unwrap();
        assert_eq!(enc.state(), SessionState::Authorized);
        let envelope = enc.finish(b"windowed").unwrap();

        assert_eq!(presenter.requests.load(Ordering::SeqCst), 1);
        assert_eq!(presenter.bound.load(Ordering::SeqCst), 0);
        assert!(logs_contain("user not authenticated within validity window"));

        // The proof is still fresh: no second request.
        let (nonce, ciphertext) = envelope::unpack(&envelope).unwrap();
        let mut dec = session.begin_decrypt(&handle, &nonce).unwrap();
        assert!(!dec.needs_authorization());
        dec.authorize(&broker).await.unwrap();
        assert_eq!(dec.finish(ciphertext).unwrap(), b"windowed");
        assert_eq!(presenter.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_proof_asks_again_exactly_once() {
        let (session, handle) = setup(
            KeyPolicy::timed(Duration::from_secs(1), Authenticators::BIOMETRIC_STRONG).unwrap(),
        );
        let broker = AuthorizationBroker::new();
        let presenter = Arc::new(Counting::default());
        broker.register(&presenter);

        let mut enc = session.begin_encrypt(&handle).unwrap();
        enc.authorize(&broker).await.unwrap();
        let envelope = enc.finish(b"short window").unwrap();
        assert_eq!(presenter.requests.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let (nonce, ciphertext) = envelope::unpack(&envelope).unwrap();
        let mut dec = session.begin_decrypt(&handle, &nonce).unwrap();
        assert!(dec.needs_authorization());
        dec.authorize(&broker).await.unwrap();
        assert_eq!(dec.finish(ciphertext).unwrap(), b"short window");
        assert_eq!(presenter.requests.load(Ordering::SeqCst), 2);
        assert_eq!(presenter.bound.load(Ordering::SeqCst), 0);

        // The renewed proof covers the next operation.
        let enc = session.begin_encrypt(&handle).unwrap();
        assert!(!enc.needs_authorization());
        assert_eq!(presenter.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_presenter_fails_before_transform() {
        let (session, handle) =
            setup(KeyPolicy::per_use(Authenticators::BIOMETRIC_STRONG).unwrap());
        let broker = AuthorizationBroker::new();

        let mut enc = session.begin_encrypt(&handle).unwrap();
        assert!(matches!(
            enc.authorize(&broker).await,
            Err(Error::NoPresenterAvailable)
        ));
        assert_eq!(enc.state(), SessionState::Failed);
        assert!(enc.finish(b"data").is_err());
    }

    #[tokio::test]
    async fn finish_requires_authorization() {
        let (session, handle) = setup(KeyPolicy::unrestricted());
        let enc = session.begin_encrypt(&handle).unwrap();
        assert!(matches!(
            enc.finish(b"data"),
            Err(Error::AuthorizationFailed { code: ERROR_CANCELED, .. })
        ));
    }

    #[test]
    fn decrypt_rejects_bad_nonce_length() {
        let (session, handle) = setup(KeyPolicy::unrestricted());
        assert!(matches!(
            session.begin_decrypt(&handle, &[0u8; 8]),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn abandoned_operation_never_transforms() {
        let (session, handle) =
            setup(KeyPolicy::per_use(Authenticators::BIOMETRIC_STRONG).unwrap());
        let broker = AuthorizationBroker::new();
        let presenter = Arc::new(Holding::default());
        broker.register(&presenter);

        let mut enc = session.begin_encrypt(&handle).unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(20), enc.authorize(&broker)).await;
        assert!(abandoned.is_err());
        assert_eq!(enc.state(), SessionState::AuthorizationPending);

        let (request, reply) = presenter.pending.lock().unwrap().pop().unwrap();
        assert!(!reply.resolve(request.approve(AuthenticatorKind::StrongBiometric)));
        assert!(enc.finish(b"data").is_err());
        assert!(!logs_contain("applying cipher transform"));
    }
}
