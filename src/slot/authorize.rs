//! CP5 key authorization: binding a token private key to a caller-held
//! key-authorization key (KAK) and authorizing operation batches.
//!
//! Both phases follow the same native dance: build the vendor parameter
//! block, call `C_AuthorizeKeyInit` against the target private key to obtain
//! a 32-byte hash, sign that hash with the KAK, submit the signature via
//! `C_AuthorizeKey`.

use openssl::{
    md::Md,
    pkey::{PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::Padding,
    sign::RsaPssSaltlen,
};
use p11_sys::{
    CK_BYTE, CK_CP5_AUTH_DATA, CK_CP5_AUTHORIZE_PARAMS, CK_CP5_INITIALIZE_PARAMS, CK_MECHANISM,
    CK_ULONG, CKM_CP5_AUTHORIZE, CKM_CP5_INITIALIZE, CP5_KEY_AUTH_PROT_RSA_PSS_SHA256,
};
use tracing::debug;

use crate::{
    error::{P11Error, P11Result},
    slot::Slot,
};

/// The vendor protocol fixes the exponent block at three bytes.
const KAK_PUBLIC_EXPONENT_LEN: usize = 3;
/// Hash handed back by `C_AuthorizeKeyInit`.
const AUTH_HASH_LEN: usize = 32;
/// Salt length of the RSASSA-PSS signature over the hash.
const PSS_SALT_LEN: i32 = 32;
const KEY_AUTHORIZATION_ASSIGNED: CK_BYTE = 1;

/// A key-authorization key: the caller-held RSA key pair whose public half is
/// bound to a token private key and whose private half signs authorization
/// hashes.
///
/// The blanket implementation for [`PKey<Private>`] covers software KAKs;
/// holders keeping the KAK elsewhere implement this themselves.
pub trait KakSigner {
    /// Big-endian modulus of the KAK public key, without a sign byte.
    fn modulus(&self) -> P11Result<Vec<u8>>;

    /// Big-endian public exponent of the KAK public key.
    fn public_exponent(&self) -> P11Result<Vec<u8>>;

    /// Modulus size in bits.
    fn modulus_bits(&self) -> P11Result<u32>;

    /// RSASSA-PSS signature (SHA-256 digest, MGF1/SHA-256, 32-byte salt,
    /// default trailer) over the raw, pre-hashed input.
    fn sign_hash(&self, hash: &[u8]) -> P11Result<Vec<u8>>;
}

impl KakSigner for PKey<Private> {
    fn modulus(&self) -> P11Result<Vec<u8>> {
        Ok(self.rsa()?.n().to_vec())
    }

    fn public_exponent(&self) -> P11Result<Vec<u8>> {
        Ok(self.rsa()?.e().to_vec())
    }

    fn modulus_bits(&self) -> P11Result<u32> {
        Ok(u32::try_from(self.rsa()?.n().num_bits()).unwrap_or(0))
    }

    fn sign_hash(&self, hash: &[u8]) -> P11Result<Vec<u8>> {
        // The token verifies over the raw hash, so the signature must be
        // produced without digesting again.
        let mut ctx = PkeyCtx::new(self)?;
        ctx.sign_init()?;
        ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
        ctx.set_signature_md(Md::sha256())?;
        ctx.set_rsa_mgf1_md(Md::sha256())?;
        ctx.set_rsa_pss_saltlen(RsaPssSaltlen::custom(PSS_SALT_LEN))?;
        let len = ctx.sign(hash, None)?;
        let mut signature = vec![0_u8; len];
        let written = ctx.sign(hash, Some(&mut signature))?;
        signature.truncate(written);
        Ok(signature)
    }
}

impl Slot {
    /// Bind the private key behind `alias` to the KAK. Must run once before
    /// the key can be authorized for use.
    pub fn key_authorize_init(&self, alias: &str, kak: &dyn KakSigner) -> P11Result<()> {
        let modulus = left_pad(&kak.modulus()?, (kak.modulus_bits()? as usize).div_ceil(8));
        let exponent = left_pad(&kak.public_exponent()?, KAK_PUBLIC_EXPONENT_LEN);

        let mut params = CK_CP5_INITIALIZE_PARAMS {
            authData: CK_CP5_AUTH_DATA {
                pModulus: modulus.as_ptr().cast_mut(),
                ulModulusLen: modulus.len() as CK_ULONG,
                pPublicExponent: exponent.as_ptr().cast_mut(),
                ulPublicExponentLen: exponent.len() as CK_ULONG,
                protocol: CP5_KEY_AUTH_PROT_RSA_PSS_SHA256,
            },
            bAssigned: KEY_AUTHORIZATION_ASSIGNED,
        };
        let mechanism = CK_MECHANISM {
            mechanism: CKM_CP5_INITIALIZE,
            pParameter: (&raw mut params).cast(),
            ulParameterLen: std::mem::size_of::<CK_CP5_INITIALIZE_PARAMS>() as CK_ULONG,
        };
        self.authorize_with_mechanism(alias, kak, &mechanism)
    }

    /// Authorize `operation_count` uses of the private key behind `alias`.
    pub fn key_authorize(
        &self,
        alias: &str,
        kak: &dyn KakSigner,
        operation_count: CK_ULONG,
    ) -> P11Result<()> {
        let mut params = CK_CP5_AUTHORIZE_PARAMS {
            ulCount: operation_count,
        };
        let mechanism = CK_MECHANISM {
            mechanism: CKM_CP5_AUTHORIZE,
            pParameter: (&raw mut params).cast(),
            ulParameterLen: std::mem::size_of::<CK_CP5_AUTHORIZE_PARAMS>() as CK_ULONG,
        };
        self.authorize_with_mechanism(alias, kak, &mechanism)
    }

    fn authorize_with_mechanism(
        &self,
        alias: &str,
        kak: &dyn KakSigner,
        mechanism: &CK_MECHANISM,
    ) -> P11Result<()> {
        let guard = self.session()?;
        let session = guard.handle();

        let private_keys = self.find_private_key_objects_by_id(session, alias.as_bytes())?;
        let Some(&private_key) = private_keys.first() else {
            return Err(P11Error::NotFound(format!(
                "no private key found for alias '{alias}'"
            )));
        };
        debug!("private key {private_key} found for key alias '{alias}'");

        let hash = self
            .api()
            .authorize_key_init(session, mechanism, private_key, AUTH_HASH_LEN)?;
        let signature = kak.sign_hash(&hash)?;
        self.api().authorize_key(session, &signature)
    }
}

/// Left-pad (or trim leading zeros of) a big-endian integer to `len` bytes.
fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    let stripped: &[u8] = {
        let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        &bytes[first_nonzero..]
    };
    if stripped.len() >= len {
        return stripped.to_vec();
    }
    let mut padded = vec![0_u8; len - stripped.len()];
    padded.extend_from_slice(stripped);
    padded
}

#[cfg(test)]
mod tests {
    use openssl::{pkey::PKey, rsa::Rsa};

    use super::{KakSigner, left_pad};

    #[test]
    fn left_pad_pads_and_strips() {
        assert_eq!(left_pad(&[0x01, 0x00, 0x01], 3), vec![0x01, 0x00, 0x01]);
        assert_eq!(left_pad(&[0x03], 3), vec![0x00, 0x00, 0x03]);
        assert_eq!(left_pad(&[0x00, 0x00, 0x01, 0x02], 3), vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn software_kak_signs_a_hash() {
        let kak = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        assert_eq!(kak.modulus_bits().unwrap(), 2048);
        assert_eq!(kak.modulus().unwrap().len(), 256);
        assert_eq!(kak.public_exponent().unwrap(), vec![0x01, 0x00, 0x01]);

        let signature = kak.sign_hash(&[0x42; 32]).unwrap();
        assert_eq!(signature.len(), 256);
    }
}
