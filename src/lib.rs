//! Pooled, caching device layer over a PKCS#11 (Cryptoki) library.
//!
//! Certificate authorities and signing services talk to hardware security
//! modules through this crate: it loads the vendor's Cryptoki module,
//! enumerates slots, pools read-write sessions per slot, resolves
//! caller-facing aliases onto certificate and key objects (memoizing searches
//! and attribute reads), drives the key lifecycle (generate, wrap, unwrap,
//! destroy), manages stored X.509 chains, and speaks the CP5 key-
//! authorization vendor protocol.
//!
//! Entry point is [`Device::open`] with the path of the PKCS#11 module; from
//! there, [`Slot`]s hand out key handles which behave like ordinary signing
//! keys:
//!
//! ```no_run
//! use p11_device::Device;
//! use p11_sys::CKM_SHA256_RSA_PKCS;
//!
//! # fn main() -> p11_device::P11Result<()> {
//! let device = Device::open("/usr/lib/pkcs11/vendor-p11.so")?;
//! let slot = device.slot_by_label("production").expect("no such token");
//! slot.login("1234")?;
//! let key = slot
//!     .acquire_private_key("signer")?
//!     .expect("no such key entry");
//! let signature = key.sign(CKM_SHA256_RSA_PKCS, b"data to sign")?;
//! slot.release_private_key(key);
//! # Ok(())
//! # }
//! ```

mod api;
mod attribute;
mod cache;
mod device;
mod error;
mod key;
mod library;
mod slot;

pub mod test_support;

#[cfg(test)]
mod tests;

pub use api::Pkcs11Api;
pub use attribute::{AttrValue, RawTemplate, Template};
pub use device::Device;
pub use error::{P11Error, P11Result};
pub use key::{
    CertificateGenerator, GeneratedKeyData, HsmSigner, KeyEntryKind, PrivateKey, SecretKey,
    SlotEntry,
};
pub use library::Pkcs11Library;
pub use slot::{KakSigner, Slot};
