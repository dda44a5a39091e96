//! Key lifecycle: generation, wrap/unwrap, lookup handles and removal.

use std::{collections::HashSet, thread, time::Duration};

use openssl::{bn::BigNum, pkey::PKey, pkey::Public, rsa::Rsa};
use p11_sys::{
    CK_ATTRIBUTE_TYPE, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE,
    CK_ULONG, CKA_CLASS, CKA_DECRYPT, CKA_ENCRYPT, CKA_EXTRACTABLE, CKA_ID, CKA_KEY_TYPE,
    CKA_LABEL, CKA_MODULUS, CKA_MODULUS_BITS, CKA_PRIVATE, CKA_PUBLIC_EXPONENT, CKA_SENSITIVE,
    CKA_SIGN, CKA_SUBJECT, CKA_TOKEN, CKA_UNWRAP, CKA_VALUE, CKA_VALUE_LEN, CKA_VERIFY, CKA_WRAP,
    CKC_X_509, CKK_RSA, CKM_DES2_KEY_GEN, CKM_DES3_KEY_GEN, CKM_DES_KEY_GEN,
    CKM_RSA_PKCS_KEY_PAIR_GEN, CKO_CERTIFICATE, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
    CKR_MECHANISM_INVALID,
};
use tracing::{debug, error, warn};

use crate::{
    attribute::{Template, decode_ulong},
    error::{P11Error, P11Result},
    key::{CertificateGenerator, GeneratedKeyData, HsmSigner, PrivateKey, SecretKey},
    slot::Slot,
};

/// Backoff before retrying an unwrap that failed with `MECHANISM_INVALID`.
const UNWRAP_RETRY_DELAY: Duration = Duration::from_millis(100);

const RSA_F4_BYTES: [u8; 3] = [0x01, 0x00, 0x01];

impl Slot {
    /// Get a private key handle with a dedicated session.
    ///
    /// The caller must eventually hand the key back via
    /// [`Slot::release_private_key`] (or drop it).
    pub fn acquire_private_key(&self, alias: &str) -> P11Result<Option<PrivateKey>> {
        let session = self.acquire_session()?;
        match self.private_key_for_alias(session, alias) {
            Ok(Some(object)) => Ok(Some(PrivateKey::new_static(
                self.shared(),
                session,
                object,
                false,
            ))),
            Ok(None) => {
                self.close_session_logged(session);
                Ok(None)
            }
            Err(e) => {
                self.close_session_logged(session);
                Err(e)
            }
        }
    }

    /// Get a private key handle that borrows a pooled session per operation.
    pub fn get_releasable_private_key(&self, alias: &str) -> P11Result<Option<PrivateKey>> {
        let guard = self.session()?;
        Ok(self
            .private_key_for_alias(guard.handle(), alias)?
            .map(|object| PrivateKey::new_releasable(self.shared(), object)))
    }

    /// Hand a private key back: destroys session-only material and returns
    /// the owned session to the pool.
    pub fn release_private_key(&self, mut key: PrivateKey) {
        key.release();
    }

    /// Materialize the public key behind an alias from its modulus and
    /// public exponent.
    pub fn get_public_key(&self, alias: &str) -> P11Result<Option<PKey<Public>>> {
        let guard = self.session()?;
        let session = guard.handle();
        let Some(object) = self.public_key_for_alias(session, alias)? else {
            return Ok(None);
        };
        Ok(Some(self.read_rsa_public_key(session, object)?))
    }

    /// Look up a secret key entry by label, returning its handle and
    /// metadata. The handle is read under a pooled session which is released
    /// before returning, so it must not be assumed valid across token
    /// restarts.
    pub fn get_secret_key(&self, alias: &str) -> P11Result<Option<SecretKey>> {
        let guard = self.session()?;
        let session = guard.handle();
        // Searching by LABEL is sufficient; the SECRET_KEY class narrows it
        // further.
        let objects = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_SECRET_KEY)
                .bytes(CKA_LABEL, alias.as_bytes().to_vec()),
        )?;
        debug!("secret objects: {objects:?}");
        if objects.len() > 1 {
            warn!("more than one secret key with CKA_LABEL={alias}");
            return Ok(None);
        }
        let Some(&object) = objects.first() else {
            return Ok(None);
        };
        let key_type = self
            .api()
            .get_attribute(session, object, CKA_KEY_TYPE)?
            .as_deref()
            .and_then(decode_ulong)
            .ok_or_else(|| P11Error::Encoding(format!("secret key {alias} has no key type")))?;
        // VALUE_LEN may be missing for DES keys on some tokens
        let bits = self
            .api()
            .get_attribute(session, object, CKA_VALUE_LEN)?
            .as_deref()
            .and_then(decode_ulong)
            .map(|len| len * 8);
        Ok(Some(SecretKey::new(object, key_type, bits)))
    }

    /// Generate an RSA key pair under `alias`, optionally generating and
    /// storing a certificate for it.
    ///
    /// Attribute overrides merge on top of the default templates, caller
    /// wins. The certificate generator runs even when `store_certificate` is
    /// false, since callers may want to keep the certificate elsewhere.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_key_pair(
        &self,
        key_algorithm: &str,
        bits: CK_ULONG,
        alias: &str,
        public_key_token: bool,
        override_public: &Template,
        override_private: &Template,
        certificate_generator: Option<&dyn CertificateGenerator>,
        store_certificate: bool,
    ) -> P11Result<()> {
        let guard = self.session()?;
        let session = guard.handle();

        self.assert_alias_unused(session, alias)?;
        if key_algorithm != "RSA" {
            return Err(P11Error::InvalidArgument(
                "only RSA supported as key algorithm".to_string(),
            ));
        }

        let mechanisms = self.api().get_mechanism_list(self.id())?;
        debug!("mechanisms: {mechanisms:04x?}");

        let mut public_template = Template::new()
            .bool(CKA_TOKEN, public_key_token)
            .bool(CKA_ENCRYPT, false)
            .bool(CKA_VERIFY, true)
            .bool(CKA_WRAP, false)
            .ulong(CKA_MODULUS_BITS, bits)
            .bytes(CKA_PUBLIC_EXPONENT, RSA_F4_BYTES.to_vec())
            .bytes(CKA_LABEL, format!("pub-{alias}").into_bytes())
            .bytes(CKA_ID, alias.as_bytes().to_vec());
        let mut private_template = Template::new()
            .bool(CKA_TOKEN, true)
            .bool(CKA_PRIVATE, true)
            .bool(CKA_SENSITIVE, true)
            .bool(CKA_DECRYPT, false)
            .bool(CKA_SIGN, true)
            .bool(CKA_UNWRAP, false)
            .bool(CKA_EXTRACTABLE, false)
            .bytes(CKA_LABEL, format!("priv-{alias}").into_bytes())
            .bytes(CKA_ID, alias.as_bytes().to_vec());
        public_template.merge(override_public);
        private_template.merge(override_private);
        debug!("public template: {public_template:?}");
        debug!("private template: {private_template:?}");

        let (public, private) = self.api().generate_key_pair(
            session,
            CKM_RSA_PKCS_KEY_PAIR_GEN,
            &public_template,
            &private_template,
        )?;
        debug!("generated public key {public} and private key {private}");

        if let Some(generator) = certificate_generator {
            let public_key = self.read_rsa_public_key(session, public)?;
            let signer = HsmSigner::new(self, session, private);
            let certificate = generator.generate_certificate(&public_key, &signer)?;

            if store_certificate {
                let subject = certificate.subject_name().to_der()?;
                let der = certificate.to_der()?;
                let template = Template::new()
                    .ulong(CKA_CLASS, CKO_CERTIFICATE)
                    .ulong(p11_sys::CKA_CERTIFICATE_TYPE, CKC_X_509)
                    .bool(CKA_TOKEN, true)
                    .bytes(CKA_LABEL, alias.as_bytes().to_vec())
                    .bytes(CKA_SUBJECT, subject)
                    .bytes(CKA_ID, alias.as_bytes().to_vec())
                    .bytes(CKA_VALUE, der);
                self.api().create_object(session, &template)?;
            }
        }

        // The alias may have a cached negative search result from before the
        // keys existed.
        if self.use_cache() {
            self.store.remove_by_value(alias.as_bytes());
        }
        Ok(())
    }

    /// Generate a symmetric key under `alias`.
    pub fn generate_key(
        &self,
        mechanism: CK_MECHANISM_TYPE,
        bits: CK_ULONG,
        alias: &str,
    ) -> P11Result<()> {
        let guard = self.session()?;
        let session = guard.handle();

        self.assert_alias_unused(session, alias)?;

        let mut template = Template::new()
            .bool(CKA_TOKEN, true)
            .bytes(CKA_ID, alias.as_bytes().to_vec())
            .bool(CKA_WRAP, true)
            .bool(CKA_UNWRAP, true)
            .bool(CKA_SENSITIVE, true)
            .bool(CKA_EXTRACTABLE, false)
            .bytes(CKA_LABEL, alias.as_bytes().to_vec());
        let mechanism = if matches!(
            mechanism,
            CKM_DES_KEY_GEN | CKM_DES2_KEY_GEN | CKM_DES3_KEY_GEN
        ) {
            // DES key lengths are fixed by the mechanism; no VALUE_LEN
            des_mechanism(mechanism, bits)?
        } else {
            template.set(CKA_VALUE_LEN, crate::attribute::AttrValue::Ulong(bits / 8));
            mechanism
        };

        let object = self.api().generate_key(session, mechanism, &template)?;
        debug!("generated secret key {object} with alias {alias}");

        if self.use_cache() {
            self.store.remove_by_value(alias.as_bytes());
        }
        Ok(())
    }

    /// Generate an RSA key pair as session objects, wrap the private key
    /// under the secret key named by `wrap_key_alias` and return the wrapped
    /// bytes together with the public key.
    pub fn generate_wrapped_key(
        &self,
        wrap_key_alias: &str,
        key_algorithm: &str,
        bits: CK_ULONG,
        wrapping_cipher: CK_MECHANISM_TYPE,
    ) -> P11Result<GeneratedKeyData> {
        if key_algorithm != "RSA" {
            return Err(P11Error::InvalidArgument(
                "only RSA supported as key algorithm".to_string(),
            ));
        }
        let guard = self.session()?;
        let session = guard.handle();

        let wrap_keys = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_SECRET_KEY)
                .bytes(CKA_LABEL, wrap_key_alias.as_bytes().to_vec()),
        )?;
        if wrap_keys.is_empty() {
            warn!("no wrap key found with alias {wrap_key_alias}");
            return Err(P11Error::NotFound(wrap_key_alias.to_string()));
        }
        if wrap_keys.len() > 1 {
            return Err(P11Error::Ambiguous(format!(
                "more than one secret key found with alias {wrap_key_alias}"
            )));
        }
        let wrap_key = wrap_keys[0];

        let mechanisms = self.api().get_mechanism_list(self.id())?;
        debug!("mechanisms: {mechanisms:04x?}");

        // Session objects: no TOKEN attribute, they die with the session
        let public_template = Template::new()
            .bool(CKA_ENCRYPT, true)
            .bool(CKA_VERIFY, true)
            .bool(CKA_WRAP, true)
            .ulong(CKA_MODULUS_BITS, bits)
            .bytes(CKA_PUBLIC_EXPONENT, RSA_F4_BYTES.to_vec());
        let private_template = Template::new()
            .bool(CKA_PRIVATE, true)
            .bool(CKA_SENSITIVE, true)
            .bool(CKA_DECRYPT, true)
            .bool(CKA_SIGN, true)
            .bool(CKA_UNWRAP, true)
            .bool(CKA_EXTRACTABLE, true);

        let (public, private) = self.api().generate_key_pair(
            session,
            CKM_RSA_PKCS_KEY_PAIR_GEN,
            &public_template,
            &private_template,
        )?;
        debug!("generated public key {public} and private key {private}");

        let public_key = self.read_rsa_public_key(session, public)?;
        debug!("using wrapping mechanism 0x{wrapping_cipher:08x}");
        let wrapped = self
            .api()
            .wrap_key(session, wrapping_cipher, wrap_key, private)?;

        Ok(GeneratedKeyData {
            wrapped_private_key: wrapped,
            public_key,
        })
    }

    /// Unwrap a wrapped private key under the secret key named by
    /// `unwrap_key_label`, yielding a static-session key whose object is
    /// destroyed on release.
    pub fn unwrap_private_key(
        &self,
        wrapped_private_key: &[u8],
        unwrap_key_label: &str,
        wrapping_cipher: CK_MECHANISM_TYPE,
    ) -> P11Result<PrivateKey> {
        let guard = self.session()?;
        let session = guard.handle();

        let secrets = self.find_secret_key_objects_by_label(session, unwrap_key_label)?;
        if secrets.is_empty() {
            return Err(P11Error::NotFound(format!(
                "no such secret key: {unwrap_key_label}"
            )));
        }
        if secrets.len() > 1 {
            return Err(P11Error::Ambiguous(format!(
                "more than one secret key found with alias {unwrap_key_label}"
            )));
        }
        let unwrap_key = secrets[0];

        let template = Template::new()
            .ulong(CKA_CLASS, CKO_PRIVATE_KEY)
            .ulong(CKA_KEY_TYPE, CKK_RSA)
            .bool(CKA_PRIVATE, true)
            .bool(CKA_DECRYPT, true)
            .bool(CKA_SIGN, true)
            .bool(CKA_SENSITIVE, true)
            .bool(CKA_EXTRACTABLE, true);

        let unwrap = || {
            self.api().unwrap_key(
                session,
                wrapping_cipher,
                unwrap_key,
                wrapped_private_key,
                &template,
            )
        };

        let mut private_key = match unwrap() {
            Ok(key) => key,
            // Some tokens sporadically report MECHANISM_INVALID on unwrap;
            // a short pause and a second attempt goes through.
            Err(e) if e.rv() == Some(CKR_MECHANISM_INVALID) => {
                error!("first C_UnwrapKey call failed: {e}");
                thread::sleep(UNWRAP_RETRY_DELAY);
                let key = unwrap()?;
                error!("C_UnwrapKey call worked after first error");
                key
            }
            Err(e) => return Err(e),
        };

        // KEY_HANDLE_INVALID has been seen at sign-init time for handles the
        // token never made real; verify the handle is enumerable and unwrap
        // once more if not.
        if !self.find_all_private_key_objects()?.contains(&private_key) {
            error!("unwrapped private key does not exist, unwrapping again");
            private_key = unwrap()?;
        }

        debug!(
            "unwrapped key: {private_key}, unwrap key: {unwrap_key}, session: {session}"
        );
        Ok(PrivateKey::new_static(
            self.shared(),
            guard.detach(),
            private_key,
            true,
        ))
    }

    /// Remove the key entry behind `alias`, including its certificate chain
    /// when one is stored. Returns whether nothing is left under the alias.
    pub fn remove_key(&self, alias: &str) -> P11Result<bool> {
        let guard = self.session()?;
        let session = guard.handle();

        let certificates = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_CERTIFICATE)
                .bytes(CKA_LABEL, alias.as_bytes().to_vec()),
        )?;
        debug!("remove_key: found certificate objects {certificates:?}");

        if certificates.is_empty() {
            // No certificate: destroy keys directly by label and by ID
            self.remove_keys_by_type(session, CKO_SECRET_KEY, alias)?;
            self.remove_keys_by_type(session, CKO_PRIVATE_KEY, alias)?;
            self.remove_keys_by_type(session, CKO_PUBLIC_KEY, alias)?;

            let remaining = self.api().find_objects(
                session,
                &Template::new()
                    .bool(CKA_TOKEN, true)
                    .bytes(CKA_LABEL, alias.as_bytes().to_vec()),
            )?;
            return Ok(remaining.is_empty());
        }

        let mut all_deleted = true;
        for certificate in certificates {
            let Some(id) = self.api().get_attribute(session, certificate, CKA_ID)? else {
                all_deleted = false;
                continue;
            };
            let private_keys = self.api().find_objects(
                session,
                &Template::new()
                    .bool(CKA_TOKEN, true)
                    .ulong(CKA_CLASS, CKO_PRIVATE_KEY)
                    .bytes(CKA_ID, id.clone()),
            )?;
            if private_keys.len() > 1 {
                warn!(
                    "more than one private key object sharing CKA_ID=0x{}",
                    hex::encode(&id)
                );
                all_deleted = false;
            } else if let Some(&private_key) = private_keys.first() {
                self.remove_key_object(session, private_key)?;
                debug!("destroyed private key {private_key} for alias {alias}");

                let mut kept_subjects = HashSet::new();
                self.remove_certificate_and_chain(session, certificate, &mut kept_subjects)?;

                // Success means the private key really is gone
                let remaining = self.api().find_objects(
                    session,
                    &Template::new()
                        .bool(CKA_TOKEN, true)
                        .ulong(CKA_CLASS, CKO_PRIVATE_KEY)
                        .bytes(CKA_ID, id.clone()),
                )?;
                all_deleted = all_deleted && remaining.is_empty();
            }
        }
        Ok(all_deleted)
    }

    fn remove_keys_by_type(
        &self,
        session: CK_SESSION_HANDLE,
        class: CK_OBJECT_CLASS,
        alias: &str,
    ) -> P11Result<()> {
        for attribute in [CKA_LABEL, CKA_ID] {
            self.remove_keys_by_search(session, class, attribute, alias.as_bytes())?;
        }
        Ok(())
    }

    fn remove_keys_by_search(
        &self,
        session: CK_SESSION_HANDLE,
        class: CK_OBJECT_CLASS,
        attribute: CK_ATTRIBUTE_TYPE,
        value: &[u8],
    ) -> P11Result<()> {
        let objects = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, class)
                .bytes(attribute, value.to_vec()),
        )?;
        debug!("remove_keys_by_search: found {objects:?}");
        for object in objects {
            self.remove_key_object(session, object)?;
            debug!("destroyed key {object}");
        }
        Ok(())
    }

    /// Destroy a key object, dropping cached search results that contain it.
    pub(crate) fn remove_key_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> P11Result<()> {
        if self.use_cache() {
            self.store.remove_by_object(object);
        }
        self.api().destroy_object(session, object)
    }

    fn assert_alias_unused(&self, session: CK_SESSION_HANDLE, alias: &str) -> P11Result<()> {
        let by_label = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .bytes(CKA_LABEL, alias.as_bytes().to_vec()),
        )?;
        if !by_label.is_empty() {
            return Err(P11Error::AlreadyExists(format!(
                "key with label {alias} already exists"
            )));
        }
        let by_id = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .bytes(CKA_ID, alias.as_bytes().to_vec()),
        )?;
        if !by_id.is_empty() {
            return Err(P11Error::AlreadyExists(format!(
                "key with ID {alias} already exists"
            )));
        }
        Ok(())
    }

    pub(crate) fn read_rsa_public_key(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> P11Result<PKey<Public>> {
        let modulus = self
            .api()
            .get_attribute(session, object, CKA_MODULUS)?
            .ok_or_else(|| P11Error::Encoding(format!("public key {object} has no modulus")))?;
        let exponent = self
            .api()
            .get_attribute(session, object, CKA_PUBLIC_EXPONENT)?
            .ok_or_else(|| {
                P11Error::Encoding(format!("public key {object} has no public exponent"))
            })?;
        let rsa = Rsa::from_public_components(
            BigNum::from_slice(&modulus)?,
            BigNum::from_slice(&exponent)?,
        )?;
        Ok(PKey::from_rsa(rsa)?)
    }

    fn close_session_logged(&self, session: CK_SESSION_HANDLE) {
        if let Err(e) = self.close_session(session) {
            warn!("failed closing session {session}: {e}");
        }
    }
}

fn des_mechanism(mechanism: CK_MECHANISM_TYPE, bits: CK_ULONG) -> P11Result<CK_MECHANISM_TYPE> {
    match mechanism {
        CKM_DES_KEY_GEN => {
            if bits == 56 || bits == 64 {
                Ok(CKM_DES_KEY_GEN)
            } else {
                Err(P11Error::InvalidArgument(
                    "DES key length is invalid".to_string(),
                ))
            }
        }
        _ => match bits {
            112 | 128 => Ok(CKM_DES2_KEY_GEN),
            168 | 192 => Ok(CKM_DES3_KEY_GEN),
            _ => Err(P11Error::InvalidArgument(
                "DESede key length is invalid".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use p11_sys::{CKM_DES2_KEY_GEN, CKM_DES3_KEY_GEN, CKM_DES_KEY_GEN};

    use super::des_mechanism;
    use crate::error::P11Error;

    #[test]
    fn des_lengths_normalize() {
        assert_eq!(des_mechanism(CKM_DES_KEY_GEN, 56).unwrap(), CKM_DES_KEY_GEN);
        assert_eq!(des_mechanism(CKM_DES_KEY_GEN, 64).unwrap(), CKM_DES_KEY_GEN);
        assert_eq!(
            des_mechanism(CKM_DES3_KEY_GEN, 112).unwrap(),
            CKM_DES2_KEY_GEN
        );
        assert_eq!(
            des_mechanism(CKM_DES2_KEY_GEN, 128).unwrap(),
            CKM_DES2_KEY_GEN
        );
        assert_eq!(
            des_mechanism(CKM_DES3_KEY_GEN, 192).unwrap(),
            CKM_DES3_KEY_GEN
        );
        assert!(matches!(
            des_mechanism(CKM_DES_KEY_GEN, 128),
            Err(P11Error::InvalidArgument(_))
        ));
        assert!(matches!(
            des_mechanism(CKM_DES3_KEY_GEN, 96),
            Err(P11Error::InvalidArgument(_))
        ));
    }
}
