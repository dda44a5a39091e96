//! Opaque key handles exposed to callers.
//!
//! A [`PrivateKey`] behaves like an ordinary signing key; whether it owns a
//! dedicated session or borrows one per operation is internal to the handle.

use std::sync::Arc;

use openssl::{
    pkey::{PKey, PKeyRef, Public},
    x509::X509,
};
use p11_sys::{CK_KEY_TYPE, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_ULONG};
use tracing::{debug, warn};

use crate::{
    error::P11Result,
    slot::Slot,
};

/// Kind of a token entry reported by [`Slot::aliases`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEntryKind {
    PrivateKey,
    SecretKey,
}

/// One enumerated token entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub alias: String,
    pub kind: KeyEntryKind,
}

/// Result of wrap-on-generate: the wrapped private key bytes and the
/// matching public key.
pub struct GeneratedKeyData {
    pub wrapped_private_key: Vec<u8>,
    pub public_key: PKey<Public>,
}

/// Callback producing the certificate stored next to a fresh key pair,
/// typically self-signed with the key pair itself.
pub trait CertificateGenerator {
    fn generate_certificate(
        &self,
        public_key: &PKeyRef<Public>,
        signer: &HsmSigner<'_>,
    ) -> P11Result<X509>;
}

/// Borrowed signing capability over a key object within one session; handed
/// to [`CertificateGenerator`] implementations.
pub struct HsmSigner<'a> {
    slot: &'a Slot,
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
}

impl<'a> HsmSigner<'a> {
    pub(crate) fn new(
        slot: &'a Slot,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Self {
        Self {
            slot,
            session,
            object,
        }
    }

    pub fn sign(&self, mechanism: CK_MECHANISM_TYPE, data: &[u8]) -> P11Result<Vec<u8>> {
        self.slot.api().sign_init(self.session, mechanism, self.object)?;
        self.slot.api().sign(self.session, data)
    }
}

enum Binding {
    /// Owns a pooled session for its whole lifetime; the object is destroyed
    /// on release when it is session-only material (unwrapped keys).
    Static {
        session: CK_SESSION_HANDLE,
        remove_on_release: bool,
    },
    /// Borrows a session per operation.
    Releasable,
    /// Cleanup already ran.
    Released,
}

/// A private key on the token.
pub struct PrivateKey {
    slot: Arc<Slot>,
    object: CK_OBJECT_HANDLE,
    binding: Binding,
}

impl PrivateKey {
    pub(crate) fn new_static(
        slot: Arc<Slot>,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        remove_on_release: bool,
    ) -> Self {
        Self {
            slot,
            object,
            binding: Binding::Static {
                session,
                remove_on_release,
            },
        }
    }

    pub(crate) fn new_releasable(slot: Arc<Slot>, object: CK_OBJECT_HANDLE) -> Self {
        Self {
            slot,
            object,
            binding: Binding::Releasable,
        }
    }

    /// Handle of the underlying key object. Only valid within the sessions of
    /// the owning slot.
    pub fn object_handle(&self) -> CK_OBJECT_HANDLE {
        self.object
    }

    /// Whether this key owns a dedicated session.
    pub fn is_static_session(&self) -> bool {
        matches!(self.binding, Binding::Static { .. })
    }

    /// Sign `data` with the given mechanism. Static-session keys reuse their
    /// session so a caller-visible operation order is kept; releasable keys
    /// borrow a pooled session for the duration of the call.
    pub fn sign(&self, mechanism: CK_MECHANISM_TYPE, data: &[u8]) -> P11Result<Vec<u8>> {
        match self.binding {
            Binding::Static { session, .. } => {
                self.slot.api().sign_init(session, mechanism, self.object)?;
                self.slot.api().sign(session, data)
            }
            Binding::Releasable | Binding::Released => {
                let guard = self.slot.session()?;
                self.slot
                    .api()
                    .sign_init(guard.handle(), mechanism, self.object)?;
                self.slot.api().sign(guard.handle(), data)
            }
        }
    }

    /// Destroy session-only material and return the owned session to the
    /// pool. Native failures during cleanup are logged, not surfaced, so
    /// resources are always reclaimed.
    pub(crate) fn release(&mut self) {
        match std::mem::replace(&mut self.binding, Binding::Released) {
            Binding::Static {
                session,
                remove_on_release,
            } => {
                debug!(
                    "releasing private key {} on session {session}",
                    self.object
                );
                if remove_on_release {
                    if let Err(e) = self.slot.api().destroy_object(session, self.object) {
                        warn!("failed destroying session key {}: {e}", self.object);
                    }
                }
                self.slot.release_session(session);
            }
            Binding::Releasable | Binding::Released => {}
        }
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.release();
    }
}

/// A secret (symmetric) key entry. Carries the metadata read at lookup time;
/// the handle is only guaranteed valid while the token stays up.
pub struct SecretKey {
    object: CK_OBJECT_HANDLE,
    key_type: CK_KEY_TYPE,
    bits: Option<CK_ULONG>,
}

impl SecretKey {
    pub(crate) fn new(
        object: CK_OBJECT_HANDLE,
        key_type: CK_KEY_TYPE,
        bits: Option<CK_ULONG>,
    ) -> Self {
        Self {
            object,
            key_type,
            bits,
        }
    }

    pub fn object_handle(&self) -> CK_OBJECT_HANDLE {
        self.object
    }

    pub fn key_type(&self) -> CK_KEY_TYPE {
        self.key_type
    }

    /// Key length in bits, when the token reports one (DES keys on some
    /// tokens do not).
    pub fn bits(&self) -> Option<CK_ULONG> {
        self.bits
    }
}
