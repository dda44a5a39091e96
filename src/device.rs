//! Top-level device: one loaded Cryptoki library and its slot index.

use std::{collections::HashMap, sync::Arc};

use p11_sys::CK_SLOT_ID;
use tracing::{debug, info};

use crate::{
    api::Pkcs11Api,
    error::P11Result,
    library::Pkcs11Library,
    slot::Slot,
};

/// Process-wide handle to one Cryptoki library. Slots are enumerated once at
/// construction; hot-plugged tokens are not picked up.
pub struct Device {
    api: Arc<dyn Pkcs11Api>,
    slots: Vec<Arc<Slot>>,
    slots_by_id: HashMap<CK_SLOT_ID, Arc<Slot>>,
    slots_by_label: HashMap<String, Arc<Slot>>,
}

impl Device {
    /// Load the library at `path` and initialize it. Initialization is
    /// idempotent: a library that is already initialized is fine.
    pub fn open<P: AsRef<std::ffi::OsStr>>(path: P) -> P11Result<Self> {
        Self::with_api(Arc::new(Pkcs11Library::load(path)?))
    }

    /// Build a device over any [`Pkcs11Api`] implementation. This is how
    /// tests run against an in-memory token.
    pub fn with_api(api: Arc<dyn Pkcs11Api>) -> P11Result<Self> {
        api.initialize()?;

        let slot_ids = api.get_slot_list(true)?;
        let mut slots = Vec::with_capacity(slot_ids.len());
        let mut slots_by_id = HashMap::with_capacity(slot_ids.len());
        let mut slots_by_label = HashMap::new();
        for slot_id in slot_ids {
            let slot = Slot::new(slot_id, api.clone());
            slots.push(slot.clone());
            slots_by_id.insert(slot_id, slot.clone());

            let token_info = api.get_token_info(slot_id)?;
            match std::str::from_utf8(&token_info.label) {
                Ok(label) => {
                    slots_by_label.insert(label.trim().to_string(), slot);
                }
                Err(_) => {
                    info!(
                        "label of slot {slot_id} / index {} could not be parsed as UTF-8, this \
                         token must be referenced by index or id",
                        slots.len() - 1
                    );
                }
            }
        }
        debug!("slots: {slots:?}");

        Ok(Self {
            api,
            slots,
            slots_by_id,
            slots_by_label,
        })
    }

    pub fn slot_by_id(&self, slot_id: CK_SLOT_ID) -> Option<&Arc<Slot>> {
        self.slots_by_id.get(&slot_id)
    }

    /// Slot by 0-based enumeration order.
    pub fn slot_by_index(&self, index: usize) -> Option<&Arc<Slot>> {
        self.slots.get(index)
    }

    /// Slot by trimmed token label. Tokens whose label is not valid UTF-8 are
    /// not indexed here.
    pub fn slot_by_label(&self, label: &str) -> Option<&Arc<Slot>> {
        self.slots_by_label.get(label)
    }

    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    pub fn api(&self) -> &Arc<dyn Pkcs11Api> {
        &self.api
    }
}
