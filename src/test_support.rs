//! Shared test backing: an in-memory token implementing [`Pkcs11Api`] and
//! X.509 fixtures.
//!
//! The mock keeps objects as attribute maps and answers searches by exact
//! template match, which is all the device layer relies on. Failure counters
//! let tests script transient native errors such as the unwrap
//! `MECHANISM_INVALID` flake.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509, X509NameBuilder},
};
use p11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_MECHANISM, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE,
    CK_SESSION_HANDLE, CK_SLOT_ID, CK_TOKEN_INFO, CK_ULONG, CK_USER_TYPE, CKA_CLASS, CKA_KEY_TYPE,
    CKA_MODULUS, CKA_MODULUS_BITS, CKA_PUBLIC_EXPONENT, CKK_AES, CKK_DES, CKK_DES2, CKK_DES3,
    CKK_GENERIC_SECRET, CKK_RSA, CKM_AES_CBC_PAD, CKM_AES_KEY_GEN, CKM_AES_KEY_WRAP,
    CKM_DES2_KEY_GEN, CKM_DES3_KEY_GEN, CKM_DES_KEY_GEN, CKM_RSA_PKCS, CKM_RSA_PKCS_KEY_PAIR_GEN,
    CKM_SHA256_RSA_PKCS, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
    CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OPERATION_NOT_INITIALIZED,
    CKR_SESSION_HANDLE_INVALID, CKR_SIGNATURE_INVALID, CKR_SLOT_ID_INVALID,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};

use crate::{
    api::Pkcs11Api,
    attribute::{AttrValue, Template, decode_ulong},
    error::{P11Error, P11Result},
};

/// Space-pad a token label to the fixed 32-byte field.
pub fn pad_label(label: &[u8]) -> [u8; 32] {
    let mut padded = [b' '; 32];
    let len = label.len().min(32);
    padded[..len].copy_from_slice(&label[..len]);
    padded
}

#[derive(Default)]
struct TokenState {
    next_session: CK_SESSION_HANDLE,
    next_object: CK_OBJECT_HANDLE,
    sessions: HashSet<CK_SESSION_HANDLE>,
    logged_in: bool,
    pending_sign: HashMap<CK_SESSION_HANDLE, CK_OBJECT_HANDLE>,
    pending_authorize: HashSet<CK_SESSION_HANDLE>,
    objects: BTreeMap<CK_OBJECT_HANDLE, BTreeMap<CK_ATTRIBUTE_TYPE, Vec<u8>>>,
}

/// In-memory token. One instance backs all of its slots; sessions are not
/// slot-scoped, which the device layer never relies on.
pub struct MockToken {
    labels: Vec<[u8; 32]>,
    state: Mutex<TokenState>,
    unwrap_failures: AtomicUsize,
    find_calls: AtomicUsize,
    attribute_calls: AtomicUsize,
    sessions_opened: AtomicUsize,
}

impl Default for MockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl MockToken {
    pub fn new() -> Self {
        Self::with_token_labels(vec![pad_label(b"MOCK TOKEN")])
    }

    pub fn with_token_labels(labels: Vec<[u8; 32]>) -> Self {
        Self {
            labels,
            state: Mutex::new(TokenState::default()),
            unwrap_failures: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
            attribute_calls: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` `C_UnwrapKey` calls fail with
    /// `MECHANISM_INVALID`.
    pub fn fail_unwrap_times(&self, count: usize) {
        self.unwrap_failures.store(count, Ordering::SeqCst);
    }

    pub fn find_call_count(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn attribute_call_count(&self) -> usize {
        self.attribute_calls.load(Ordering::SeqCst)
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Seed an object directly, bypassing the device layer.
    pub fn insert_object(&self, attributes: &[(CK_ATTRIBUTE_TYPE, AttrValue)]) -> CK_OBJECT_HANDLE {
        let mut state = self.lock();
        let handle = state.new_object_handle();
        let encoded = attributes
            .iter()
            .map(|(type_, value)| (*type_, value.encode()))
            .collect();
        state.objects.insert(handle, encoded);
        handle
    }

    pub fn contains_object(&self, object: CK_OBJECT_HANDLE) -> bool {
        self.lock().objects.contains_key(&object)
    }

    pub fn object_attribute(
        &self,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Option<Vec<u8>> {
        self.lock().objects.get(&object)?.get(&attribute).cloned()
    }

    /// Count live objects matching a template, for post-condition checks.
    pub fn matching_object_count(&self, template: &Template) -> usize {
        self.lock().matches(template).len()
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().expect("mock token mutex poisoned")
    }
}

impl TokenState {
    fn new_object_handle(&mut self) -> CK_OBJECT_HANDLE {
        self.next_object += 1;
        self.next_object
    }

    fn check_session(&self, session: CK_SESSION_HANDLE) -> P11Result<()> {
        if self.sessions.contains(&session) {
            Ok(())
        } else {
            Err(P11Error::cryptoki("mock", CKR_SESSION_HANDLE_INVALID))
        }
    }

    fn matches(&self, template: &Template) -> Vec<CK_OBJECT_HANDLE> {
        self.objects
            .iter()
            .filter(|(_, attributes)| {
                template.iter().all(|(type_, value)| {
                    attributes.get(type_).map(Vec::as_slice) == Some(value.encode().as_slice())
                })
            })
            .map(|(&handle, _)| handle)
            .collect()
    }

    fn insert_from_template(
        &mut self,
        template: &Template,
        extra: &[(CK_ATTRIBUTE_TYPE, AttrValue)],
    ) -> CK_OBJECT_HANDLE {
        let handle = self.new_object_handle();
        let mut attributes: BTreeMap<CK_ATTRIBUTE_TYPE, Vec<u8>> = template
            .iter()
            .map(|(type_, value)| (*type_, value.encode()))
            .collect();
        for (type_, value) in extra {
            attributes.entry(*type_).or_insert_with(|| value.encode());
        }
        self.objects.insert(handle, attributes);
        handle
    }
}

/// Deterministic stand-in for an RSA modulus; leading byte kept non-zero.
fn fake_modulus(seed: CK_OBJECT_HANDLE, len: usize) -> Vec<u8> {
    let mut modulus = vec![0_u8; len.max(1)];
    for (i, byte) in modulus.iter_mut().enumerate() {
        *byte = (seed as u8).wrapping_mul(31).wrapping_add(i as u8) | 0x01;
    }
    modulus[0] |= 0x80;
    modulus
}

fn secret_key_type(mechanism: CK_MECHANISM_TYPE) -> CK_ULONG {
    match mechanism {
        CKM_DES_KEY_GEN => CKK_DES,
        CKM_DES2_KEY_GEN => CKK_DES2,
        CKM_DES3_KEY_GEN => CKK_DES3,
        CKM_AES_KEY_GEN => CKK_AES,
        _ => CKK_GENERIC_SECRET,
    }
}

impl Pkcs11Api for MockToken {
    fn initialize(&self) -> P11Result<()> {
        Ok(())
    }

    fn finalize(&self) -> P11Result<()> {
        Ok(())
    }

    fn get_slot_list(&self, _token_present: bool) -> P11Result<Vec<CK_SLOT_ID>> {
        Ok((0..self.labels.len() as CK_SLOT_ID).collect())
    }

    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> P11Result<CK_TOKEN_INFO> {
        let label = self
            .labels
            .get(slot_id as usize)
            .ok_or(P11Error::cryptoki("mock", CKR_SLOT_ID_INVALID))?;
        Ok(CK_TOKEN_INFO {
            label: *label,
            ..CK_TOKEN_INFO::default()
        })
    }

    fn get_mechanism_list(&self, _slot_id: CK_SLOT_ID) -> P11Result<Vec<CK_MECHANISM_TYPE>> {
        Ok(vec![
            CKM_RSA_PKCS_KEY_PAIR_GEN,
            CKM_RSA_PKCS,
            CKM_SHA256_RSA_PKCS,
            CKM_AES_KEY_GEN,
            CKM_AES_CBC_PAD,
            CKM_AES_KEY_WRAP,
        ])
    }

    fn open_session(&self, _slot_id: CK_SLOT_ID, _flags: CK_FLAGS) -> P11Result<CK_SESSION_HANDLE> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.next_session += 1;
        let session = state.next_session;
        state.sessions.insert(session);
        Ok(session)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> P11Result<()> {
        let mut state = self.lock();
        if !state.sessions.remove(&session) {
            return Err(P11Error::cryptoki("mock", CKR_SESSION_HANDLE_INVALID));
        }
        state.pending_sign.remove(&session);
        state.pending_authorize.remove(&session);
        Ok(())
    }

    fn login(&self, session: CK_SESSION_HANDLE, _user: CK_USER_TYPE, _pin: &[u8]) -> P11Result<()> {
        let mut state = self.lock();
        state.check_session(session)?;
        if state.logged_in {
            return Err(P11Error::cryptoki("mock", CKR_USER_ALREADY_LOGGED_IN));
        }
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> P11Result<()> {
        let mut state = self.lock();
        state.check_session(session)?;
        if !state.logged_in {
            return Err(P11Error::cryptoki("mock", CKR_USER_NOT_LOGGED_IN));
        }
        state.logged_in = false;
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &Template,
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        state.check_session(session)?;
        Ok(state.matches(template))
    }

    fn get_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> P11Result<Option<Vec<u8>>> {
        Ok(self
            .get_attributes(session, object, &[attribute])?
            .pop()
            .flatten())
    }

    fn get_attributes(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> P11Result<Vec<Option<Vec<u8>>>> {
        self.attribute_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        state.check_session(session)?;
        let object = state
            .objects
            .get(&object)
            .ok_or(P11Error::cryptoki("mock", CKR_OBJECT_HANDLE_INVALID))?;
        Ok(attributes
            .iter()
            .map(|type_| object.get(type_).cloned())
            .collect())
    }

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE> {
        let mut state = self.lock();
        state.check_session(session)?;
        Ok(state.insert_from_template(template, &[]))
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> P11Result<()> {
        let mut state = self.lock();
        state.check_session(session)?;
        state
            .objects
            .remove(&object)
            .map(|_| ())
            .ok_or(P11Error::cryptoki("mock", CKR_OBJECT_HANDLE_INVALID))
    }

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE> {
        let mut state = self.lock();
        state.check_session(session)?;
        Ok(state.insert_from_template(
            template,
            &[
                (CKA_CLASS, AttrValue::Ulong(CKO_SECRET_KEY)),
                (CKA_KEY_TYPE, AttrValue::Ulong(secret_key_type(mechanism))),
            ],
        ))
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: CK_MECHANISM_TYPE,
        public_template: &Template,
        private_template: &Template,
    ) -> P11Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        let mut state = self.lock();
        state.check_session(session)?;
        let bits = public_template
            .get(CKA_MODULUS_BITS)
            .map(AttrValue::encode)
            .as_deref()
            .and_then(decode_ulong)
            .unwrap_or(2048);
        let modulus = fake_modulus(state.next_object + 1, bits as usize / 8);

        let public = state.insert_from_template(
            public_template,
            &[
                (CKA_CLASS, AttrValue::Ulong(CKO_PUBLIC_KEY)),
                (CKA_KEY_TYPE, AttrValue::Ulong(CKK_RSA)),
                (CKA_MODULUS, AttrValue::Bytes(modulus.clone())),
                (
                    CKA_PUBLIC_EXPONENT,
                    AttrValue::Bytes(vec![0x01, 0x00, 0x01]),
                ),
            ],
        );
        let private = state.insert_from_template(
            private_template,
            &[
                (CKA_CLASS, AttrValue::Ulong(CKO_PRIVATE_KEY)),
                (CKA_KEY_TYPE, AttrValue::Ulong(CKK_RSA)),
                (CKA_MODULUS, AttrValue::Bytes(modulus)),
            ],
        );
        Ok((public, private))
    }

    fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: CK_MECHANISM_TYPE,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
    ) -> P11Result<Vec<u8>> {
        let state = self.lock();
        state.check_session(session)?;
        if !state.objects.contains_key(&wrapping_key) || !state.objects.contains_key(&key) {
            return Err(P11Error::cryptoki("mock", CKR_OBJECT_HANDLE_INVALID));
        }
        let mut wrapped = b"wrapped:".to_vec();
        wrapped.extend_from_slice(&key.to_ne_bytes());
        Ok(wrapped)
    }

    fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: CK_MECHANISM_TYPE,
        unwrapping_key: CK_OBJECT_HANDLE,
        _wrapped: &[u8],
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE> {
        if self
            .unwrap_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(P11Error::cryptoki("C_UnwrapKey", CKR_MECHANISM_INVALID));
        }
        let mut state = self.lock();
        state.check_session(session)?;
        if !state.objects.contains_key(&unwrapping_key) {
            return Err(P11Error::cryptoki("mock", CKR_OBJECT_HANDLE_INVALID));
        }
        let modulus = fake_modulus(state.next_object + 1, 256);
        Ok(state.insert_from_template(template, &[(CKA_MODULUS, AttrValue::Bytes(modulus))]))
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: CK_MECHANISM_TYPE,
        key: CK_OBJECT_HANDLE,
    ) -> P11Result<()> {
        let mut state = self.lock();
        state.check_session(session)?;
        if !state.objects.contains_key(&key) {
            return Err(P11Error::cryptoki("mock", p11_sys::CKR_KEY_HANDLE_INVALID));
        }
        state.pending_sign.insert(session, key);
        Ok(())
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> P11Result<Vec<u8>> {
        let mut state = self.lock();
        state.check_session(session)?;
        let key = state
            .pending_sign
            .remove(&session)
            .ok_or(P11Error::cryptoki("mock", CKR_OPERATION_NOT_INITIALIZED))?;
        let mut signature = vec![0_u8; 256];
        for (i, byte) in signature.iter_mut().enumerate() {
            let input = data.get(i % data.len().max(1)).copied().unwrap_or(0);
            *byte = input ^ (key as u8) ^ (i as u8);
        }
        Ok(signature)
    }

    fn authorize_key_init(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &CK_MECHANISM,
        key: CK_OBJECT_HANDLE,
        hash_len: usize,
    ) -> P11Result<Vec<u8>> {
        let mut state = self.lock();
        state.check_session(session)?;
        if !state.objects.contains_key(&key) {
            return Err(P11Error::cryptoki("mock", p11_sys::CKR_KEY_HANDLE_INVALID));
        }
        state.pending_authorize.insert(session);
        Ok((0..hash_len)
            .map(|i| (key as u8).wrapping_mul(7) ^ (i as u8))
            .collect())
    }

    fn authorize_key(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> P11Result<()> {
        let mut state = self.lock();
        state.check_session(session)?;
        if !state.pending_authorize.remove(&session) {
            return Err(P11Error::cryptoki("mock", CKR_OPERATION_NOT_INITIALIZED));
        }
        if signature.is_empty() {
            return Err(P11Error::cryptoki("mock", CKR_SIGNATURE_INVALID));
        }
        Ok(())
    }
}

static SERIAL: AtomicUsize = AtomicUsize::new(1);

fn build_certificate(
    cn: &str,
    issuer: Option<(&X509, &PKey<Private>)>,
) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).expect("rsa keygen")).expect("pkey");

    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", cn).expect("cn entry");
    let name = name.build();

    let mut builder = openssl::x509::X509Builder::new().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = SERIAL.fetch_add(1, Ordering::SeqCst);
    let serial = BigNum::from_u32(serial as u32)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(&name).expect("subject");
    match issuer {
        Some((issuer_cert, _)) => {
            builder
                .set_issuer_name(issuer_cert.subject_name())
                .expect("issuer");
        }
        None => {
            builder.set_issuer_name(&name).expect("issuer");
        }
    }
    builder.set_pubkey(&key).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("set not after");
    match issuer {
        Some((_, issuer_key)) => {
            builder
                .sign(issuer_key, MessageDigest::sha256())
                .expect("sign");
        }
        None => {
            builder.sign(&key, MessageDigest::sha256()).expect("sign");
        }
    }
    (builder.build(), key)
}

/// A fresh self-signed certificate with `CN=cn` and its private key.
pub fn self_signed_certificate(cn: &str) -> (X509, PKey<Private>) {
    build_certificate(cn, None)
}

/// A fresh certificate with `CN=cn` signed by `issuer`.
pub fn certificate_signed_by(
    cn: &str,
    issuer: &X509,
    issuer_key: &PKey<Private>,
) -> (X509, PKey<Private>) {
    build_certificate(cn, Some((issuer, issuer_key)))
}

#[cfg(test)]
pub(crate) fn log_init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}
