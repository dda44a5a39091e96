use std::{cell::RefCell, sync::Arc};

use openssl::{
    pkey::{PKey, PKeyRef, Private, Public},
    rsa::Rsa,
    x509::X509,
};
use p11_sys::{
    CK_OBJECT_HANDLE, CKA_CERTIFICATE_TYPE, CKA_CLASS, CKA_ID, CKA_ISSUER, CKA_KEY_TYPE,
    CKA_LABEL, CKA_SUBJECT, CKA_TOKEN, CKA_VALUE, CKA_VALUE_LEN, CKC_X_509, CKK_AES, CKK_DES3,
    CKK_RSA, CKM_AES_KEY_GEN, CKM_AES_KEY_WRAP, CKM_DES3_KEY_GEN, CKM_SHA256_RSA_PKCS,
    CKO_CERTIFICATE, CKO_PRIVATE_KEY, CKO_SECRET_KEY,
};

use crate::{
    AttrValue, CertificateGenerator, Device, HsmSigner, KeyEntryKind, P11Error, P11Result,
    Slot, Template,
    key::SlotEntry,
    test_support::{
        MockToken, certificate_signed_by, log_init, pad_label, self_signed_certificate,
    },
};

fn device_over(token: &Arc<MockToken>) -> Device {
    Device::with_api(token.clone()).expect("device construction")
}

fn single_slot() -> (Arc<MockToken>, Device) {
    log_init();
    let token = Arc::new(MockToken::new());
    let device = device_over(&token);
    (token, device)
}

fn the_slot(device: &Device) -> &Arc<Slot> {
    device.slot_by_index(0).expect("slot 0")
}

fn seed_certificate(
    token: &MockToken,
    certificate: &X509,
    label: Option<&str>,
    id: &[u8],
) -> CK_OBJECT_HANDLE {
    let mut attributes = vec![
        (CKA_CLASS, AttrValue::Ulong(CKO_CERTIFICATE)),
        (CKA_CERTIFICATE_TYPE, AttrValue::Ulong(CKC_X_509)),
        (CKA_TOKEN, AttrValue::Bool(true)),
        (
            CKA_SUBJECT,
            AttrValue::Bytes(certificate.subject_name().to_der().unwrap()),
        ),
        (
            CKA_ISSUER,
            AttrValue::Bytes(certificate.issuer_name().to_der().unwrap()),
        ),
        (CKA_VALUE, AttrValue::Bytes(certificate.to_der().unwrap())),
        (CKA_ID, AttrValue::Bytes(id.to_vec())),
    ];
    if let Some(label) = label {
        attributes.push((CKA_LABEL, AttrValue::Bytes(label.as_bytes().to_vec())));
    }
    token.insert_object(&attributes)
}

fn seed_private_key(token: &MockToken, id: &[u8]) -> CK_OBJECT_HANDLE {
    token.insert_object(&[
        (CKA_CLASS, AttrValue::Ulong(CKO_PRIVATE_KEY)),
        (CKA_KEY_TYPE, AttrValue::Ulong(CKK_RSA)),
        (CKA_TOKEN, AttrValue::Bool(true)),
        (CKA_ID, AttrValue::Bytes(id.to_vec())),
    ])
}

fn seed_secret_key(token: &MockToken, label: &str) -> CK_OBJECT_HANDLE {
    token.insert_object(&[
        (CKA_CLASS, AttrValue::Ulong(CKO_SECRET_KEY)),
        (CKA_KEY_TYPE, AttrValue::Ulong(CKK_AES)),
        (CKA_TOKEN, AttrValue::Bool(true)),
        (CKA_LABEL, AttrValue::Bytes(label.as_bytes().to_vec())),
        (CKA_VALUE_LEN, AttrValue::Ulong(32)),
    ])
}

fn token_objects_with_label(token: &MockToken, label: &str) -> usize {
    token.matching_object_count(
        &Template::new()
            .bool(CKA_TOKEN, true)
            .bytes(CKA_LABEL, label.as_bytes().to_vec()),
    )
}

/// Generator producing a software self-signed certificate, recording its DER
/// and probing the HSM-backed signer on the way.
struct CapturingGenerator {
    cn: String,
    der: RefCell<Option<Vec<u8>>>,
}

impl CapturingGenerator {
    fn new(cn: &str) -> Self {
        Self {
            cn: cn.to_string(),
            der: RefCell::new(None),
        }
    }
}

impl CertificateGenerator for CapturingGenerator {
    fn generate_certificate(
        &self,
        public_key: &PKeyRef<Public>,
        signer: &HsmSigner<'_>,
    ) -> P11Result<X509> {
        assert!(public_key.rsa().is_ok());
        let probe = signer.sign(CKM_SHA256_RSA_PKCS, b"generator probe")?;
        assert!(!probe.is_empty());
        let (certificate, _key) = self_signed_certificate(&self.cn);
        *self.der.borrow_mut() = Some(certificate.to_der()?);
        Ok(certificate)
    }
}

#[test]
fn generate_sign_remove_round_trip() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    let generator = CapturingGenerator::new("Round Trip");
    slot.generate_key_pair(
        "RSA",
        2048,
        "k1",
        true,
        &Template::new(),
        &Template::new(),
        Some(&generator),
        true,
    )?;
    let generated_der = generator.der.borrow().clone().expect("generator ran");

    let stored = slot.get_certificate("k1")?.expect("stored certificate");
    assert_eq!(stored.to_der()?, generated_der);

    let key = slot.acquire_private_key("k1")?.expect("private key");
    assert!(key.is_static_session());
    let signature = key.sign(CKM_SHA256_RSA_PKCS, &[0x5a; 32])?;
    assert!(!signature.is_empty());
    slot.release_private_key(key);

    assert!(slot.remove_key("k1")?);
    assert!(slot.get_certificate("k1")?.is_none());
    assert_eq!(token_objects_with_label(&token, "k1"), 0);
    Ok(())
}

#[test]
fn generate_key_pair_enforces_preconditions() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key_pair(
        "RSA",
        2048,
        "dup",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;
    let again = slot.generate_key_pair(
        "RSA",
        2048,
        "dup",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    );
    assert!(matches!(again, Err(P11Error::AlreadyExists(_))));

    let wrong = slot.generate_key_pair(
        "EC",
        256,
        "ec1",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    );
    assert!(matches!(wrong, Err(P11Error::InvalidArgument(_))));
    Ok(())
}

#[test]
fn aliases_lists_private_and_secret_entries() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);

    let generator = CapturingGenerator::new("Listed Signer");
    slot.generate_key_pair(
        "RSA",
        2048,
        "signer1",
        true,
        &Template::new(),
        &Template::new(),
        Some(&generator),
        true,
    )?;
    slot.generate_key(CKM_AES_KEY_GEN, 256, "aes1")?;

    let entries: Vec<SlotEntry> = slot.aliases()?.collect();
    assert!(entries.contains(&SlotEntry {
        alias: "signer1".to_string(),
        kind: KeyEntryKind::PrivateKey,
    }));
    assert!(entries.contains(&SlotEntry {
        alias: "aes1".to_string(),
        kind: KeyEntryKind::SecretKey,
    }));
    Ok(())
}

#[test]
fn ambiguous_label_reads_warn_and_miss() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    let (cert_a, _) = self_signed_certificate("Dup A");
    let (cert_b, _) = self_signed_certificate("Dup B");
    seed_certificate(&token, &cert_a, Some("dup"), b"dup");
    seed_certificate(&token, &cert_b, Some("dup"), b"dup");
    seed_private_key(&token, b"dup");
    seed_private_key(&token, b"dup");

    // The first certificate wins for reads
    let first = slot.get_certificate("dup")?.expect("first certificate");
    assert_eq!(first.to_der()?, cert_a.to_der()?);

    // Two private keys share the resolved ID: that cannot be disambiguated
    assert!(slot.acquire_private_key("dup")?.is_none());
    assert!(slot.get_releasable_private_key("dup")?.is_none());
    Ok(())
}

#[test]
fn cache_only_changes_native_call_counts() -> P11Result<()> {
    log_init();

    let run = |use_cache: bool| -> P11Result<(Vec<bool>, usize)> {
        let token = Arc::new(MockToken::new());
        let device = device_over(&token);
        let slot = the_slot(&device);
        slot.set_use_cache(use_cache);

        let mut observations = Vec::new();
        observations.push(slot.get_certificate("k")?.is_some());
        observations.push(slot.get_certificate("k")?.is_some());
        let generator = CapturingGenerator::new("Cache Probe");
        slot.generate_key_pair(
            "RSA",
            2048,
            "k",
            true,
            &Template::new(),
            &Template::new(),
            Some(&generator),
            true,
        )?;
        // The pre-generation misses must not stick: negative entries are
        // purged when the alias comes into existence
        observations.push(slot.get_certificate("k")?.is_some());
        observations.push(slot.get_certificate("k")?.is_some());
        observations.push(slot.get_public_key("k")?.is_some());
        Ok((observations, token.find_call_count()))
    };

    let (cached, cached_finds) = run(true)?;
    let (uncached, uncached_finds) = run(false)?;
    assert_eq!(cached, uncached);
    assert_eq!(cached, vec![false, false, true, true, true]);
    assert!(cached_finds < uncached_finds);
    Ok(())
}

#[test]
fn session_pool_reuses_and_tracks_sessions() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    assert!(slot.get_certificate("nothing")?.is_none());
    assert_eq!(slot.pool_counts(), (1, 0, false));
    assert_eq!(token.open_session_count(), 1);

    // A second read reuses the pooled session
    assert!(slot.get_certificate("nothing")?.is_none());
    assert_eq!(token.open_session_count(), 1);

    slot.generate_key_pair(
        "RSA",
        2048,
        "held",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;
    let key = slot.acquire_private_key("held")?.expect("key");
    // The static key owns the pooled session
    assert_eq!(slot.pool_counts(), (0, 1, false));
    slot.release_private_key(key);
    assert_eq!(slot.pool_counts(), (1, 0, false));
    assert_eq!(token.open_session_count(), 1);

    // A miss closes the acquired session instead of pooling it
    assert!(slot.acquire_private_key("absent")?.is_none());
    assert_eq!(slot.pool_counts(), (0, 0, false));
    Ok(())
}

#[test]
fn login_retains_a_session_and_logout_is_idempotent() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    slot.login("1234")?;
    assert_eq!(slot.pool_counts(), (0, 0, true));
    // A second login reuses the retained session and tolerates the token
    // saying it is already logged in
    slot.login("1234")?;
    assert_eq!(slot.pool_counts(), (0, 0, true));

    slot.logout()?;
    assert_eq!(slot.pool_counts(), (1, 0, false));
    // Second logout: no login session, token reports USER_NOT_LOGGED_IN,
    // treated as a no-op
    slot.logout()?;
    assert_eq!(slot.pool_counts(), (1, 0, false));
    assert_eq!(token.open_session_count(), 1);
    Ok(())
}

#[test]
fn unwrap_retries_after_mechanism_invalid() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);
    seed_secret_key(&token, "wrapkey");

    token.fail_unwrap_times(1);
    let key = slot.unwrap_private_key(b"opaque wrapped blob", "wrapkey", CKM_AES_KEY_WRAP)?;
    assert!(key.is_static_session());
    assert!(token.contains_object(key.object_handle()));

    let signature = key.sign(CKM_SHA256_RSA_PKCS, &[7; 32])?;
    assert!(!signature.is_empty());

    // Unwrapped keys are session-only material: destroyed on release. The
    // post-unwrap enumeration ran on a second pooled session, so two
    // sessions end up idle.
    let object = key.object_handle();
    slot.release_private_key(key);
    assert!(!token.contains_object(object));
    assert_eq!(slot.pool_counts(), (2, 0, false));
    Ok(())
}

#[test]
fn unwrap_requires_a_unique_wrapping_key() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    let missing = slot.unwrap_private_key(b"blob", "nokey", CKM_AES_KEY_WRAP);
    assert!(matches!(missing, Err(P11Error::NotFound(_))));

    seed_secret_key(&token, "twice");
    seed_secret_key(&token, "twice");
    let ambiguous = slot.unwrap_private_key(b"blob", "twice", CKM_AES_KEY_WRAP);
    assert!(matches!(ambiguous, Err(P11Error::Ambiguous(_))));
    // Error paths still return their sessions to the pool
    assert_eq!(slot.pool_counts(), (1, 0, false));
    Ok(())
}

#[test]
fn shared_ca_certificate_survives_first_removal() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);
    slot.set_use_cache(true);

    let (root, root_key) = self_signed_certificate("Shared Root");
    let (leaf_a, _) = certificate_signed_by("Entry A", &root, &root_key);
    let (leaf_b, _) = certificate_signed_by("Entry B", &root, &root_key);

    let root_object = seed_certificate(&token, &root, None, b"shared-root");
    let leaf_a_object = seed_certificate(&token, &leaf_a, Some("a"), b"a");
    seed_private_key(&token, b"a");
    seed_certificate(&token, &leaf_b, Some("b"), b"b");
    seed_private_key(&token, b"b");

    // Prime the cache so removal also has entries to invalidate
    assert!(slot.get_certificate("a")?.is_some());

    assert!(slot.remove_key("a")?);
    assert!(token.contains_object(root_object));
    assert_eq!(token_objects_with_label(&token, "a"), 0);
    // No cache entry may survive for the destroyed leaf
    assert!(!slot.store.references_object(leaf_a_object));

    assert!(slot.remove_key("b")?);
    assert!(!token.contains_object(root_object));
    assert!(!slot.store.references_object(root_object));
    assert_eq!(token_objects_with_label(&token, "b"), 0);
    Ok(())
}

#[test]
fn import_chain_replaces_leaf_and_same_subject_intermediates() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    let (root, root_key) = self_signed_certificate("Import Root");
    let (old_intermediate, old_intermediate_key) =
        certificate_signed_by("Import Intermediate", &root, &root_key);
    let (new_intermediate, new_intermediate_key) =
        certificate_signed_by("Import Intermediate", &root, &root_key);
    let (old_leaf, _) = certificate_signed_by("Import Leaf", &old_intermediate, &old_intermediate_key);
    let (new_leaf, _) = certificate_signed_by("Import Leaf", &new_intermediate, &new_intermediate_key);
    let (other_leaf, _) =
        certificate_signed_by("Other Entry", &old_intermediate, &old_intermediate_key);

    seed_certificate(&token, &old_leaf, Some("k1"), b"k1");
    seed_private_key(&token, b"k1");
    let old_intermediate_object = seed_certificate(&token, &old_intermediate, None, b"old-int");
    let other_leaf_object = seed_certificate(&token, &other_leaf, Some("other"), b"other");

    slot.import_certificate_chain(
        &[new_leaf.clone(), new_intermediate.clone(), root.clone()],
        "k1",
    )?;

    // The other entry's leaf is untouched, the old intermediate replaced
    assert!(token.contains_object(other_leaf_object));
    assert!(!token.contains_object(old_intermediate_object));

    let chain = slot.get_certificate_chain("k1")?;
    let ders: Vec<Vec<u8>> = chain.iter().map(|c| c.to_der().unwrap()).collect();
    assert_eq!(
        ders,
        vec![new_leaf.to_der()?, new_intermediate.to_der()?, root.to_der()?]
    );

    // CA certificates carry the subject/issuer/serial identifier
    let subject = new_intermediate.subject_name().to_der()?;
    let stored_intermediates = token.matching_object_count(
        &Template::new()
            .bool(CKA_TOKEN, true)
            .ulong(CKA_CLASS, CKO_CERTIFICATE)
            .bytes(CKA_SUBJECT, subject),
    );
    assert_eq!(stored_intermediates, 1);
    Ok(())
}

#[test]
fn import_chain_requires_an_existing_entry() {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);
    let (cert, _) = self_signed_certificate("Nobody");
    let result = slot.import_certificate_chain(&[cert], "ghost");
    assert!(matches!(result, Err(P11Error::NotFound(_))));
}

#[test]
fn invalid_token_label_keeps_slot_reachable_by_id_and_index() {
    log_init();
    let token = Arc::new(MockToken::with_token_labels(vec![
        pad_label(b"GOOD LABEL"),
        [0xff; 32],
    ]));
    let device = device_over(&token);

    assert_eq!(device.slots().len(), 2);
    // The malformed label indexes nowhere, but id and index still reach the
    // token
    assert_eq!(device.slot_by_label("GOOD LABEL").map(|s| s.id()), Some(0));
    assert_eq!(device.slot_by_id(1).map(|s| s.id()), Some(1));
    assert_eq!(device.slot_by_index(1).map(|s| s.id()), Some(1));
}

#[test]
fn security_info_dumps_protection_attributes() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);
    slot.generate_key_pair(
        "RSA",
        2048,
        "si",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;

    let mut out = String::new();
    slot.security_info("si", &mut out)?;
    assert!(out.contains("  CKA_SENSITIVE=true"));
    assert!(out.contains("  CKA_EXTRACTABLE=false"));
    assert!(out.contains("  CKA_PRIVATE=true"));
    // Attributes the token does not report still show up in the dump
    assert!(out.contains("  CKA_ALWAYS_SENSITIVE=n/a"));

    let missing = slot.security_info("ghost", &mut String::new());
    assert!(matches!(missing, Err(P11Error::NotFound(_))));
    Ok(())
}

#[test]
fn generate_wrapped_key_returns_material_and_public_key() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    let missing = slot.generate_wrapped_key("nokey", "RSA", 2048, CKM_AES_KEY_WRAP);
    assert!(matches!(missing, Err(P11Error::NotFound(_))));

    seed_secret_key(&token, "wrap");
    let generated = slot.generate_wrapped_key("wrap", "RSA", 2048, CKM_AES_KEY_WRAP)?;
    assert!(generated.wrapped_private_key.starts_with(b"wrapped:"));
    assert_eq!(generated.public_key.rsa()?.n().num_bits(), 2048);

    seed_secret_key(&token, "wrap");
    let ambiguous = slot.generate_wrapped_key("wrap", "RSA", 2048, CKM_AES_KEY_WRAP);
    assert!(matches!(ambiguous, Err(P11Error::Ambiguous(_))));
    Ok(())
}

#[test]
fn symmetric_key_generation_and_lookup() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key(CKM_AES_KEY_GEN, 256, "aes")?;
    let aes = slot.get_secret_key("aes")?.expect("aes key");
    assert_eq!(aes.key_type(), CKK_AES);
    assert_eq!(aes.bits(), Some(256));

    // DES mechanisms have a fixed length and no VALUE_LEN on the template
    slot.generate_key(CKM_DES3_KEY_GEN, 168, "des")?;
    let des = slot.get_secret_key("des")?.expect("des key");
    assert_eq!(des.key_type(), CKK_DES3);
    assert_eq!(des.bits(), None);

    let bad = slot.generate_key(CKM_DES3_KEY_GEN, 96, "bad");
    assert!(matches!(bad, Err(P11Error::InvalidArgument(_))));
    assert!(slot.get_secret_key("missing")?.is_none());
    Ok(())
}

#[test]
fn remove_key_without_certificate_clears_all_classes() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key(CKM_AES_KEY_GEN, 128, "gone")?;
    assert!(slot.remove_key("gone")?);
    assert_eq!(token_objects_with_label(&token, "gone"), 0);
    // Removing what does not exist reports success: nothing is left behind
    assert!(slot.remove_key("never-existed")?);
    Ok(())
}

#[test]
fn key_authorization_runs_both_phases() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key_pair(
        "RSA",
        2048,
        "auth",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;

    let kak: PKey<Private> = PKey::from_rsa(Rsa::generate(2048).expect("kak")).expect("pkey");
    slot.key_authorize_init("auth", &kak)?;
    slot.key_authorize("auth", &kak, 100)?;

    let missing = slot.key_authorize_init("ghost", &kak);
    assert!(matches!(missing, Err(P11Error::NotFound(_))));
    assert_eq!(slot.pool_counts(), (1, 0, false));
    Ok(())
}

#[test]
fn releasable_keys_borrow_sessions_per_operation() -> P11Result<()> {
    let (token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key_pair(
        "RSA",
        2048,
        "rel",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;
    let key = slot.get_releasable_private_key("rel")?.expect("key");
    assert!(!key.is_static_session());
    assert_eq!(slot.pool_counts(), (1, 0, false));

    let signature = key.sign(CKM_SHA256_RSA_PKCS, &[1; 32])?;
    assert!(!signature.is_empty());
    assert_eq!(slot.pool_counts(), (1, 0, false));
    assert_eq!(token.open_session_count(), 1);

    slot.release_private_key(key);
    assert_eq!(slot.pool_counts(), (1, 0, false));
    Ok(())
}

#[test]
fn parallel_signing_keeps_the_pool_consistent() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key_pair(
        "RSA",
        2048,
        "mt",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let slot = slot.clone();
            std::thread::spawn(move || -> P11Result<()> {
                for _ in 0..8 {
                    let key = slot
                        .acquire_private_key("mt")?
                        .expect("key present");
                    let signature = key.sign(CKM_SHA256_RSA_PKCS, &[i as u8; 32])?;
                    assert!(!signature.is_empty());
                    slot.release_private_key(key);
                }
                Ok(())
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("thread")?;
    }

    let (idle, active, login) = slot.pool_counts();
    assert_eq!(active, 0);
    assert!(!login);
    assert!(idle >= 1 && idle <= 4);
    Ok(())
}

#[test]
fn get_public_key_materializes_rsa_components() -> P11Result<()> {
    let (_token, device) = single_slot();
    let slot = the_slot(&device);

    slot.generate_key_pair(
        "RSA",
        2048,
        "pk",
        true,
        &Template::new(),
        &Template::new(),
        None,
        false,
    )?;
    let public = slot.get_public_key("pk")?.expect("public key");
    assert_eq!(public.rsa()?.n().num_bits(), 2048);
    assert!(slot.get_public_key("absent")?.is_none());
    Ok(())
}
