//! Certificate chain import, retrieval and removal.
//!
//! Chains are stored the way the Oracle PKCS#11 keystore convention lays them
//! out: the leaf carries the entry's label and ID, CA certificates are keyed
//! by a subject/issuer/serial identifier and assumed unique per subject DN.

use std::collections::HashSet;

use openssl::x509::{X509, X509NameRef};
use p11_sys::{
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CKA_CLASS, CKA_ID, CKA_ISSUER, CKA_LABEL,
    CKA_SERIAL_NUMBER, CKA_SUBJECT, CKA_TOKEN, CKA_VALUE, CKC_X_509, CKO_CERTIFICATE,
    CKO_PRIVATE_KEY,
};
use tracing::{debug, error, warn};

use crate::{
    attribute::Template,
    error::{P11Error, P11Result},
    slot::Slot,
};

/// Upper bound on subject/issuer walks; also the brake against circular
/// chains on a corrupted token.
const MAX_CHAIN_LENGTH: usize = 100;

impl Slot {
    /// Import a certificate chain for an existing key entry, replacing the
    /// previous chain. CA certificates still referenced by other entries are
    /// kept; a CA certificate sharing a subject with an imported one is
    /// replaced.
    pub fn import_certificate_chain(&self, chain: &[X509], alias: &str) -> P11Result<()> {
        let guard = self.session()?;
        let session = guard.handle();

        let certificates = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_CERTIFICATE)
                .bytes(CKA_LABEL, alias.as_bytes().to_vec()),
        )?;
        debug!("certificate objects: {certificates:?}");
        let Some(&entry_certificate) = certificates.first() else {
            return Err(P11Error::NotFound(format!("no such key: {alias}")));
        };

        let id = self
            .api()
            .get_attribute(session, entry_certificate, CKA_ID)?
            .ok_or_else(|| {
                P11Error::NotFound(format!("certificate {alias} has no ID attribute"))
            })?;

        // Sanity check that a private key actually backs this entry
        let private_keys = self.api().find_objects(
            session,
            &Template::new()
                .bool(CKA_TOKEN, true)
                .ulong(CKA_CLASS, CKO_PRIVATE_KEY)
                .bytes(CKA_ID, id.clone()),
        )?;
        debug!("private objects: {private_keys:?}");
        if private_keys.is_empty() {
            return Err(P11Error::NotFound(format!("no such key: {alias}")));
        }
        if private_keys.len() > 1 {
            error!(
                "more than one private key object available with CKA_ID: 0x{}",
                hex::encode(&id)
            );
        }

        // Remove the previous chain, remembering which subjects stayed
        // because another entry still chains to them.
        let mut kept_subjects = HashSet::new();
        self.remove_certificate_and_chain(session, entry_certificate, &mut kept_subjects)?;

        let Some((leaf, issuers)) = chain.split_first() else {
            return Ok(());
        };

        let subject = leaf.subject_name().to_der()?;
        let template = Template::new()
            .ulong(CKA_CLASS, CKO_CERTIFICATE)
            .ulong(p11_sys::CKA_CERTIFICATE_TYPE, CKC_X_509)
            .bool(CKA_TOKEN, true)
            .bytes(CKA_LABEL, alias.as_bytes().to_vec())
            .bytes(CKA_SUBJECT, subject)
            .bytes(CKA_ISSUER, leaf.issuer_name().to_der()?)
            .bytes(CKA_SERIAL_NUMBER, serial_bytes(leaf)?)
            .bytes(CKA_ID, alias.as_bytes().to_vec())
            .bytes(CKA_VALUE, certificate_der(leaf)?);
        let stored = self.api().create_object(session, &template)?;
        debug!("stored signer certificate object: {stored}");

        for certificate in issuers {
            let subject = certificate.subject_name().to_der()?;

            // CA subject DNs are assumed unique; an existing certificate with
            // this subject is the one being replaced
            let existing = self.api().find_objects(
                session,
                &Template::new()
                    .bool(CKA_TOKEN, true)
                    .ulong(CKA_CLASS, CKO_CERTIFICATE)
                    .bytes(CKA_SUBJECT, subject.clone()),
            )?;
            for object in existing {
                self.remove_certificate_object(session, object)?;
                debug!("destroyed certificate {object} for alias {alias}");
            }

            let template = Template::new()
                .ulong(CKA_CLASS, CKO_CERTIFICATE)
                .ulong(p11_sys::CKA_CERTIFICATE_TYPE, CKC_X_509)
                .bool(CKA_TOKEN, true)
                .bytes(CKA_SUBJECT, subject)
                .bytes(CKA_ISSUER, certificate.issuer_name().to_der()?)
                .bytes(CKA_SERIAL_NUMBER, serial_bytes(certificate)?)
                .bytes(CKA_VALUE, certificate_der(certificate)?)
                .bytes(CKA_ID, certificate_id(certificate)?.into_bytes());
            let stored = self.api().create_object(session, &template)?;
            debug!("stored CA certificate object: {stored}");
        }
        Ok(())
    }

    /// Walk a stored chain starting at `certificate`, destroying every
    /// certificate no other entry chains to. Subjects that stay are collected
    /// in `kept_subjects`.
    pub(crate) fn remove_certificate_and_chain(
        &self,
        session: CK_SESSION_HANDLE,
        certificate: CK_OBJECT_HANDLE,
        kept_subjects: &mut HashSet<Vec<u8>>,
    ) -> P11Result<()> {
        let mut current = certificate;
        let mut iterations = 0;
        while iterations < MAX_CHAIN_LENGTH {
            iterations += 1;
            let Some(subject) = self.api().get_attribute(session, current, CKA_SUBJECT)? else {
                warn!("certificate object {current} has no subject, stopping chain removal");
                break;
            };
            let Some(issuer) = self.api().get_attribute(session, current, CKA_ISSUER)? else {
                warn!("certificate object {current} has no issuer, stopping chain removal");
                break;
            };

            // A certificate still issuing for someone else stays
            let issued = self.api().find_objects(
                session,
                &Template::new()
                    .bool(CKA_TOKEN, true)
                    .ulong(CKA_CLASS, CKO_CERTIFICATE)
                    .bytes(CKA_ISSUER, subject.clone()),
            )?;
            if issued.is_empty() || (issued.len() == 1 && issued[0] == current) {
                self.remove_certificate_object(session, current)?;
            } else {
                kept_subjects.insert(subject.clone());
            }

            if subject == issuer {
                // self-signed root
                return Ok(());
            }

            let issuers = self.api().find_objects(
                session,
                &Template::new()
                    .bool(CKA_TOKEN, true)
                    .ulong(CKA_CLASS, CKO_CERTIFICATE)
                    .bytes(CKA_SUBJECT, issuer.clone()),
            )?;
            match issuers.first() {
                None => return Ok(()),
                Some(&next) => {
                    if issuers.len() > 1 {
                        warn!(
                            "multiple certificate objects sharing the same CKA_SUBJECT: 0x{}",
                            hex::encode(&issuer)
                        );
                    }
                    current = next;
                }
            }
        }
        // Either a chain longer than the bound or an issuer loop on the token
        warn!(
            "more than {MAX_CHAIN_LENGTH} certificates in chain (or circular subject/issuer \
             chain), not all certificates may have been removed"
        );
        Ok(())
    }

    /// Destroy a certificate object and every cache entry referring to it.
    pub(crate) fn remove_certificate_object(
        &self,
        session: CK_SESSION_HANDLE,
        certificate: CK_OBJECT_HANDLE,
    ) -> P11Result<()> {
        if self.use_cache() {
            self.store.remove_all_by_object(certificate);
        }
        self.api().destroy_object(session, certificate)
    }

    /// The certificate stored under `alias`, when one exists. With more than
    /// one match the first is returned and a warning logged.
    pub fn get_certificate(&self, alias: &str) -> P11Result<Option<X509>> {
        let guard = self.session()?;
        let session = guard.handle();

        let certificates = self.find_certificate_objects_by_label(session, alias)?;
        debug!("certificate objects: {certificates:?}");
        let Some(&certificate) = certificates.first() else {
            debug!("certificate with this alias does not exist: {alias}");
            return Ok(None);
        };
        let der = self
            .certificate_value_attribute(session, certificate)?
            .ok_or_else(|| {
                P11Error::Encoding(format!("certificate object {certificate} has no value"))
            })?;
        Ok(Some(parse_der(&der)?))
    }

    /// The stored chain for `alias`, leaf first, following subject/issuer
    /// links until a self-signed certificate or a missing issuer.
    pub fn get_certificate_chain(&self, alias: &str) -> P11Result<Vec<X509>> {
        let guard = self.session()?;
        let session = guard.handle();
        let mut chain = Vec::new();

        let certificates = self.find_certificate_objects_by_label(session, alias)?;
        debug!("certificate objects: {certificates:?}");
        let Some(&leaf) = certificates.first() else {
            return Ok(chain);
        };
        let der = self
            .certificate_value_attribute(session, leaf)?
            .ok_or_else(|| P11Error::Encoding(format!("certificate object {leaf} has no value")))?;
        let mut certificate = parse_der(&der)?;

        // The iteration cap doubles as loop protection against tokens with a
        // subject/issuer circle
        for _ in 0..MAX_CHAIN_LENGTH {
            let self_signed =
                certificate.subject_name().to_der()? == certificate.issuer_name().to_der()?;
            let issuer = certificate.issuer_name().to_der()?;
            chain.push(certificate);
            if self_signed {
                return Ok(chain);
            }
            let issuers = self.find_certificate_objects_by_subject(session, &issuer)?;
            let Some(&next) = issuers.first() else {
                return Ok(chain);
            };
            let der = self
                .certificate_value_attribute(session, next)?
                .ok_or_else(|| {
                    P11Error::Encoding(format!("certificate object {next} has no value"))
                })?;
            certificate = parse_der(&der)?;
        }
        warn!("more than {MAX_CHAIN_LENGTH} certificates in chain for alias {alias}");
        Ok(chain)
    }
}

fn parse_der(der: &[u8]) -> P11Result<X509> {
    X509::from_der(der).map_err(|e| P11Error::Encoding(format!("invalid X.509 DER: {e}")))
}

fn certificate_der(certificate: &X509) -> P11Result<Vec<u8>> {
    Ok(certificate.to_der()?)
}

fn serial_bytes(certificate: &X509) -> P11Result<Vec<u8>> {
    Ok(certificate.serial_number().to_bn()?.to_vec())
}

/// Identifier for a CA certificate object, following the SunPKCS11 keystore
/// format: canonical subject "/" canonical issuer "/" decimal serial.
pub(crate) fn certificate_id(certificate: &X509) -> P11Result<String> {
    let serial = certificate.serial_number().to_bn()?.to_dec_str()?;
    Ok(format!(
        "{}/{}/{}",
        canonical_name(certificate.subject_name())?,
        canonical_name(certificate.issuer_name())?,
        &*serial
    ))
}

/// Deterministic lower-case rendering of a DN, close to the canonical form
/// used by keystore implementations.
fn canonical_name(name: &X509NameRef) -> P11Result<String> {
    let mut parts = Vec::new();
    for entry in name.entries() {
        let key = entry
            .object()
            .nid()
            .short_name()
            .unwrap_or("UNDEF")
            .to_lowercase();
        let value = match entry.data().as_utf8() {
            Ok(value) => value.trim().to_lowercase(),
            Err(_) => hex::encode(entry.data().as_slice()),
        };
        parts.push(format!("{key}={value}"));
    }
    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use crate::test_support::self_signed_certificate;

    use super::certificate_id;

    #[test]
    fn certificate_id_has_three_segments() {
        let (certificate, _key) = self_signed_certificate("Example Root CA");
        let id = certificate_id(&certificate).unwrap();
        let segments: Vec<&str> = id.split('/').collect();
        assert_eq!(segments.len(), 3);
        assert!(segments[0].contains("cn=example root ca"));
        assert_eq!(segments[0], segments[1]);
    }
}
