//! Alias resolution: mapping caller-supplied names onto certificate and key
//! objects under the label-vs-ID policy.
//!
//! Every find-by-X here consults the slot store when caching is enabled and
//! writes back both positive and negative results.

use p11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CKA_ID, CKA_LABEL,
    CKA_SUBJECT, CKA_TOKEN, CKA_VALUE, CKO_CERTIFICATE, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY,
    CKO_SECRET_KEY,
};
use tracing::{debug, warn};

use crate::{
    attribute::Template,
    cache::{AttributeKey, SearchKey},
    error::P11Result,
    slot::Slot,
};

impl Slot {
    /// Search for token objects of `class` by one attribute, going through
    /// the slot store when caching is on. Empty results are cached too; they
    /// are purged when an object is created under the searched value.
    fn cached_find(
        &self,
        session: CK_SESSION_HANDLE,
        class: CK_OBJECT_CLASS,
        attribute: CK_ATTRIBUTE_TYPE,
        value: &[u8],
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        let template = Template::new()
            .bool(CKA_TOKEN, true)
            .ulong(p11_sys::CKA_CLASS, class)
            .bytes(attribute, value.to_vec());
        if !self.use_cache() {
            return self.api().find_objects(session, &template);
        }
        let key = SearchKey {
            class,
            attribute,
            value: value.to_vec(),
        };
        if let Some(handles) = self.store.get_objects(&key) {
            return Ok(handles);
        }
        let handles = self.api().find_objects(session, &template)?;
        self.store.add_objects(key, &handles);
        Ok(handles)
    }

    /// Cached attribute read; absent values are never cached.
    fn cached_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> P11Result<Option<Vec<u8>>> {
        if !self.use_cache() {
            return self.api().get_attribute(session, object, attribute);
        }
        let key = AttributeKey { object, attribute };
        if let Some(value) = self.store.get_attribute(&key) {
            return Ok(Some(value));
        }
        let value = self.api().get_attribute(session, object, attribute)?;
        if let Some(value) = &value {
            self.store.add_attribute(key, value);
        }
        Ok(value)
    }

    pub(crate) fn find_certificate_objects_by_label(
        &self,
        session: CK_SESSION_HANDLE,
        alias: &str,
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        let certificates =
            self.cached_find(session, CKO_CERTIFICATE, CKA_LABEL, alias.as_bytes())?;
        if certificates.len() > 1 {
            warn!("more than one certificate object with label {alias}");
        }
        Ok(certificates)
    }

    pub(crate) fn find_certificate_objects_by_subject(
        &self,
        session: CK_SESSION_HANDLE,
        subject: &[u8],
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        self.cached_find(session, CKO_CERTIFICATE, CKA_SUBJECT, subject)
    }

    pub(crate) fn find_public_key_objects_by_id(
        &self,
        session: CK_SESSION_HANDLE,
        id: &[u8],
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        self.cached_find(session, CKO_PUBLIC_KEY, CKA_ID, id)
    }

    pub(crate) fn find_private_key_objects_by_id(
        &self,
        session: CK_SESSION_HANDLE,
        id: &[u8],
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        self.cached_find(session, CKO_PRIVATE_KEY, CKA_ID, id)
    }

    pub(crate) fn find_secret_key_objects_by_label(
        &self,
        session: CK_SESSION_HANDLE,
        alias: &str,
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        self.cached_find(session, CKO_SECRET_KEY, CKA_LABEL, alias.as_bytes())
    }

    /// All private key objects, token and session alike, on a session of
    /// their own.
    pub(crate) fn find_all_private_key_objects(&self) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        let guard = self.session()?;
        self.api().find_objects(
            guard.handle(),
            &Template::new().ulong(p11_sys::CKA_CLASS, CKO_PRIVATE_KEY),
        )
    }

    /// ID attribute of a certificate object, cached.
    pub(crate) fn certificate_id_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        certificate: CK_OBJECT_HANDLE,
    ) -> P11Result<Option<Vec<u8>>> {
        self.cached_attribute(session, certificate, CKA_ID)
    }

    /// VALUE attribute (the DER encoding) of a certificate object, cached.
    pub(crate) fn certificate_value_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        certificate: CK_OBJECT_HANDLE,
    ) -> P11Result<Option<Vec<u8>>> {
        self.cached_attribute(session, certificate, CKA_VALUE)
    }

    /// Find the private key behind an alias: certificate label first, then
    /// the alias bytes as key ID. Ambiguity and a missing certificate ID are
    /// logged and resolved to "no key".
    pub(crate) fn private_key_for_alias(
        &self,
        session: CK_SESSION_HANDLE,
        alias: &str,
    ) -> P11Result<Option<CK_OBJECT_HANDLE>> {
        let certificates = self.find_certificate_objects_by_label(session, alias)?;
        debug!("certificate objects: {certificates:?}");

        let private_keys = if let Some(&certificate) = certificates.first() {
            let Some(id) = self.certificate_id_attribute(session, certificate)? else {
                warn!("missing ID attribute on certificate object with label {alias}");
                return Ok(None);
            };
            let keys = self.find_private_key_objects_by_id(session, &id)?;
            if keys.len() > 1 {
                warn!(
                    "more than one private key object sharing CKA_ID=0x{}",
                    hex::encode(&id)
                );
                return Ok(None);
            }
            keys
        } else {
            // No certificate: assume the key pair carries the alias in its ID
            let keys = self.find_private_key_objects_by_id(session, alias.as_bytes())?;
            if keys.len() > 1 {
                warn!("more than one private key object sharing CKA_ID={alias}");
                return Ok(None);
            }
            keys
        };

        match private_keys.first() {
            Some(&key) => {
                debug!("private key object: {key}");
                Ok(Some(key))
            }
            None => {
                warn!("no private key found for alias {alias}");
                Ok(None)
            }
        }
    }

    /// Find the public key behind an alias; a missing public key is fine
    /// since a certificate plus private key is a complete entry.
    pub(crate) fn public_key_for_alias(
        &self,
        session: CK_SESSION_HANDLE,
        alias: &str,
    ) -> P11Result<Option<CK_OBJECT_HANDLE>> {
        let certificates = self.find_certificate_objects_by_label(session, alias)?;
        debug!("certificate objects: {certificates:?}");

        let id = if let Some(&certificate) = certificates.first() {
            let Some(id) = self.certificate_id_attribute(session, certificate)? else {
                warn!("missing ID attribute on object with label {alias}");
                return Ok(None);
            };
            id
        } else {
            alias.as_bytes().to_vec()
        };
        let public_keys = self.find_public_key_objects_by_id(session, &id)?;
        if public_keys.len() > 1 {
            warn!(
                "more than one public key object sharing CKA_ID=0x{}",
                hex::encode(&id)
            );
            return Ok(None);
        }
        Ok(public_keys.first().copied())
    }
}
