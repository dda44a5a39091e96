//! A slot of the device: session pool, object resolution, key lifecycle,
//! certificate chains and vendor key authorization.

mod authorize;
mod certs;
mod keys;
mod resolver;

use std::{
    collections::HashSet,
    fmt,
    fmt::Write as _,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use p11_sys::{
    CK_SESSION_HANDLE, CK_SLOT_ID, CKA_ALWAYS_SENSITIVE, CKA_CLASS, CKA_DERIVE, CKA_EXTRACTABLE,
    CKA_ID, CKA_LABEL, CKA_MODIFIABLE, CKA_NEVER_EXTRACTABLE, CKA_PRIVATE, CKA_SENSITIVE,
    CKA_TOKEN, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKO_CERTIFICATE, CKO_PRIVATE_KEY,
    CKO_SECRET_KEY, CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN, CKU_USER,
};
use tracing::{debug, error, trace, warn};
use zeroize::Zeroizing;

pub use authorize::KakSigner;

use crate::{
    api::Pkcs11Api,
    attribute::{Template, attribute_name},
    cache::SlotStore,
    error::{P11Error, P11Result},
    key::{KeyEntryKind, SlotEntry},
};

/// One token slot. Owns the session pool and the per-slot attribute cache;
/// shared between threads behind an `Arc`.
pub struct Slot {
    id: CK_SLOT_ID,
    api: Arc<dyn Pkcs11Api>,
    pool: Mutex<Pool>,
    pub(crate) store: SlotStore,
    use_cache: AtomicBool,
    // Backref for handing shared ownership to key handles
    self_ref: Weak<Slot>,
}

#[derive(Default)]
struct Pool {
    idle: Vec<CK_SESSION_HANDLE>,
    active: HashSet<CK_SESSION_HANDLE>,
    login_session: Option<CK_SESSION_HANDLE>,
}

impl Slot {
    pub(crate) fn new(id: CK_SLOT_ID, api: Arc<dyn Pkcs11Api>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            api,
            pool: Mutex::new(Pool::default()),
            store: SlotStore::new(),
            use_cache: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("slot accessed after its device was dropped")
    }

    pub fn id(&self) -> CK_SLOT_ID {
        self.id
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Relaxed)
    }

    pub fn set_use_cache(&self, use_cache: bool) {
        self.use_cache.store(use_cache, Ordering::Relaxed);
    }

    /// Drop every memoized search result and attribute value for this slot.
    pub fn clear_cache(&self) {
        self.store.clear();
    }

    pub(crate) fn api(&self) -> &dyn Pkcs11Api {
        &*self.api
    }

    fn lock_pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().expect("slot pool mutex poisoned")
    }

    /// Pop an idle session or open a new read-write serial session. The slot
    /// lock is not held across the native open.
    pub(crate) fn acquire_session(&self) -> P11Result<CK_SESSION_HANDLE> {
        {
            let mut pool = self.lock_pool();
            if let Some(session) = pool.idle.pop() {
                trace!("popped session {session}");
                pool.active.insert(session);
                return Ok(session);
            }
        }
        let session = self
            .api
            .open_session(self.id, CKF_RW_SESSION | CKF_SERIAL_SESSION)
            .map_err(|e| P11Error::Offline(e.to_string()))?;
        self.lock_pool().active.insert(session);
        Ok(session)
    }

    /// Return an active session to the top of the idle stack. A session that
    /// is not active is logged and left alone so that every handle keeps
    /// exactly one home.
    pub(crate) fn release_session(&self, session: CK_SESSION_HANDLE) {
        let mut pool = self.lock_pool();
        if !pool.active.remove(&session) {
            error!("releasing session not active: {session}");
            return;
        }
        pool.idle.push(session);
        trace!("released session {session}");
    }

    /// Close an active session outright instead of pooling it.
    pub(crate) fn close_session(&self, session: CK_SESSION_HANDLE) -> P11Result<()> {
        let result = self.api.close_session(session);
        let mut pool = self.lock_pool();
        pool.active.remove(&session);
        if pool.idle.contains(&session) {
            error!("session that was closed is still marked as idle: {session}");
        }
        result
    }

    /// Acquire a session scoped to the returned guard; released on drop.
    pub(crate) fn session(&self) -> P11Result<SessionGuard<'_>> {
        Ok(SessionGuard {
            slot: self,
            handle: self.acquire_session()?,
        })
    }

    /// Log the token in. A dedicated session is acquired and retained so the
    /// login state outlives any pooled session.
    pub fn login(&self, pin: &str) -> P11Result<()> {
        let pin = Zeroizing::new(pin.as_bytes().to_vec());
        let session = {
            let pool = self.lock_pool();
            pool.login_session
        };
        let session = match session {
            Some(session) => session,
            None => {
                let session = self.acquire_session()?;
                let mut pool = self.lock_pool();
                match pool.login_session {
                    // Lost a login race; keep the winner's session
                    Some(existing) => {
                        pool.active.remove(&session);
                        pool.idle.push(session);
                        existing
                    }
                    None => {
                        pool.active.remove(&session);
                        pool.login_session = Some(session);
                        session
                    }
                }
            }
        };
        trace!("C_Login({session})");
        match self.api.login(session, CKU_USER, &pin) {
            Ok(()) => Ok(()),
            Err(e) if e.rv() == Some(CKR_USER_ALREADY_LOGGED_IN) => {
                warn!("user already logged in, ignoring login");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Log the token out. The login session is returned to the idle stack on
    /// every exit path; a logout without a preceding login is a no-op.
    pub fn logout(&self) -> P11Result<()> {
        let retained = {
            let mut pool = self.lock_pool();
            if let Some(session) = pool.login_session.take() {
                pool.active.insert(session);
                Some(session)
            } else {
                None
            }
        };
        let session = match retained {
            Some(session) => session,
            None => self.acquire_session()?,
        };
        trace!("C_Logout({session})");
        let result = self.api.logout(session);
        self.release_session(session);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.rv() == Some(CKR_USER_NOT_LOGGED_IN) => {
                debug!("logout without active login");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Enumerate key entries of the token.
    ///
    /// A private key is listed under its certificate's label when one exists,
    /// otherwise under the UTF-8 reading of its ID; keys without an ID are
    /// skipped. Secret keys need both an ID and a label.
    pub fn aliases(&self) -> P11Result<impl Iterator<Item = SlotEntry>> {
        let guard = self.session()?;
        let session = guard.handle();
        let mut entries = Vec::new();

        let private_keys = self.api.find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_PRIVATE_KEY),
        )?;
        debug!("private key objects: {private_keys:?}");
        for key in private_keys {
            let Some(id) = self.api.get_attribute(session, key, CKA_ID)? else {
                continue;
            };
            let certificates = self.api.find_objects(
                session,
                &Template::new()
                    .bool(CKA_TOKEN, true)
                    .ulong(CKA_CLASS, CKO_CERTIFICATE)
                    .bytes(CKA_ID, id.clone()),
            )?;
            let label = match certificates.first() {
                Some(&certificate) => self.api.get_attribute(session, certificate, CKA_LABEL)?,
                None => {
                    debug!(
                        "private key does not have a corresponding certificate: {}",
                        hex::encode(&id)
                    );
                    None
                }
            };
            entries.push(SlotEntry {
                alias: to_alias(&id, label.as_deref()),
                kind: KeyEntryKind::PrivateKey,
            });
        }

        let secret_keys = self.api.find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_SECRET_KEY),
        )?;
        debug!("secret key objects: {secret_keys:?}");
        for key in secret_keys {
            let Some(id) = self.api.get_attribute(session, key, CKA_ID)? else {
                continue;
            };
            let Some(label) = self.api.get_attribute(session, key, CKA_LABEL)? else {
                continue;
            };
            entries.push(SlotEntry {
                alias: to_alias(&id, Some(&label)),
                kind: KeyEntryKind::SecretKey,
            });
        }

        Ok(entries.into_iter())
    }

    /// Append a textual dump of the protection attributes of the private key
    /// behind `alias`.
    pub fn security_info(&self, alias: &str, out: &mut String) -> P11Result<()> {
        const ATTRIBUTES: [p11_sys::CK_ATTRIBUTE_TYPE; 7] = [
            CKA_SENSITIVE,
            CKA_ALWAYS_SENSITIVE,
            CKA_EXTRACTABLE,
            CKA_NEVER_EXTRACTABLE,
            CKA_PRIVATE,
            CKA_DERIVE,
            CKA_MODIFIABLE,
        ];
        let guard = self.session()?;
        let session = guard.handle();
        let key = self
            .private_key_for_alias(session, alias)?
            .ok_or_else(|| P11Error::NotFound(alias.to_string()))?;
        let values = self.api.get_attributes(session, key, &ATTRIBUTES)?;
        for (attribute, value) in ATTRIBUTES.iter().zip(values) {
            let _ = write!(out, "  {}=", attribute_name(*attribute));
            match value.as_deref() {
                Some([flag]) => {
                    let _ = write!(out, "{}", *flag != 0);
                }
                Some(bytes) => {
                    let _ = write!(out, "0x{}", hex::encode(bytes));
                }
                None => {
                    let _ = write!(out, "n/a");
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool_counts(&self) -> (usize, usize, bool) {
        let pool = self.lock_pool();
        (pool.idle.len(), pool.active.len(), pool.login_session.is_some())
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.lock_pool();
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("idle", &pool.idle.len())
            .field("active", &pool.active.len())
            .field("login", &pool.login_session.is_some())
            .finish()
    }
}

fn to_alias(id: &[u8], label: Option<&[u8]>) -> String {
    match label {
        Some(label) if !label.is_empty() => String::from_utf8_lossy(label).into_owned(),
        _ => String::from_utf8_lossy(id).into_owned(),
    }
}

/// RAII wrapper around a pooled session; releases on drop.
pub(crate) struct SessionGuard<'a> {
    slot: &'a Slot,
    handle: CK_SESSION_HANDLE,
}

impl SessionGuard<'_> {
    pub fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    /// Keep the session out of the pool, transferring ownership to the caller.
    pub fn detach(self) -> CK_SESSION_HANDLE {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.slot.release_session(self.handle);
    }
}
