//! Typed interface over the Cryptoki function set used by the device layer.
//!
//! The production implementation ([`crate::Pkcs11Library`]) resolves the
//! symbols out of a dynamically loaded module. The trait is the seam that
//! lets the rest of the crate run against an in-memory token in tests.

use p11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_MECHANISM, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE,
    CK_SESSION_HANDLE, CK_SLOT_ID, CK_TOKEN_INFO, CK_USER_TYPE,
};

use crate::{attribute::Template, error::P11Result};

/// One Cryptoki library, initialized at most once per process.
///
/// Every method may block on synchronous I/O with the token; callers must not
/// hold slot-level locks across these calls.
pub trait Pkcs11Api: Send + Sync {
    /// `C_Initialize`. An "already initialized" response from the library is
    /// treated as success.
    fn initialize(&self) -> P11Result<()>;

    fn finalize(&self) -> P11Result<()>;

    fn get_slot_list(&self, token_present: bool) -> P11Result<Vec<CK_SLOT_ID>>;

    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> P11Result<CK_TOKEN_INFO>;

    fn get_mechanism_list(&self, slot_id: CK_SLOT_ID) -> P11Result<Vec<CK_MECHANISM_TYPE>>;

    fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> P11Result<CK_SESSION_HANDLE>;

    fn close_session(&self, session: CK_SESSION_HANDLE) -> P11Result<()>;

    fn login(&self, session: CK_SESSION_HANDLE, user: CK_USER_TYPE, pin: &[u8]) -> P11Result<()>;

    fn logout(&self, session: CK_SESSION_HANDLE) -> P11Result<()>;

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &Template,
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>>;

    /// Single attribute read. An attribute the object does not carry (or whose
    /// value the token refuses to disclose) is `Ok(None)`, not an error.
    fn get_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> P11Result<Option<Vec<u8>>>;

    /// Batched attribute read; one result slot per requested attribute, in
    /// order, with unavailable values as `None`.
    fn get_attributes(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> P11Result<Vec<Option<Vec<u8>>>>;

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE>;

    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE)
        -> P11Result<()>;

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE>;

    /// Returns `(public, private)` handles.
    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        public_template: &Template,
        private_template: &Template,
    ) -> P11Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)>;

    fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
    ) -> P11Result<Vec<u8>>;

    fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        unwrapping_key: CK_OBJECT_HANDLE,
        wrapped: &[u8],
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE>;

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        key: CK_OBJECT_HANDLE,
    ) -> P11Result<()>;

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> P11Result<Vec<u8>>;

    /// Vendor `C_AuthorizeKeyInit`. The mechanism carries the marshalled CP5
    /// parameter block; the returned buffer is the hash to be signed by the
    /// key-authorization key, `hash_len` bytes long.
    fn authorize_key_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &CK_MECHANISM,
        key: CK_OBJECT_HANDLE,
        hash_len: usize,
    ) -> P11Result<Vec<u8>>;

    /// Vendor `C_AuthorizeKey`: submit the signature over the hash.
    fn authorize_key(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> P11Result<()>;
}
