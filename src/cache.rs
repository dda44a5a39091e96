//! Per-slot memoization of object searches and attribute reads.
//!
//! Search results are cached under (object class, searched attribute,
//! searched value) including empty results, so that repeated lookups of a
//! missing alias short-circuit. Negative entries are purged whenever an
//! object is created under the searched value, and every entry referring to a
//! destroyed handle is dropped.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use p11_sys::{CK_ATTRIBUTE_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE};

/// Key of a cached `C_FindObjects` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SearchKey {
    pub class: CK_OBJECT_CLASS,
    pub attribute: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

/// Key of a cached `C_GetAttributeValue` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AttributeKey {
    pub object: CK_OBJECT_HANDLE,
    pub attribute: CK_ATTRIBUTE_TYPE,
}

#[derive(Default)]
struct Entries {
    searches: HashMap<SearchKey, Vec<CK_OBJECT_HANDLE>>,
    attributes: HashMap<AttributeKey, Vec<u8>>,
}

/// The slot store. All access goes through an internal mutex; the store is
/// shared between every session of a slot.
#[derive(Default)]
pub(crate) struct SlotStore(Mutex<Entries>);

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_objects(&self, key: &SearchKey) -> Option<Vec<CK_OBJECT_HANDLE>> {
        self.lock().searches.get(key).cloned()
    }

    pub fn add_objects(&self, key: SearchKey, handles: &[CK_OBJECT_HANDLE]) {
        self.lock().searches.insert(key, handles.to_vec());
    }

    pub fn get_attribute(&self, key: &AttributeKey) -> Option<Vec<u8>> {
        self.lock().attributes.get(key).cloned()
    }

    /// Absent attribute values must not be cached; callers only store blobs
    /// they actually read.
    pub fn add_attribute(&self, key: AttributeKey, value: &[u8]) {
        self.lock().attributes.insert(key, value.to_vec());
    }

    /// Purge search entries whose searched value equals `value`, regardless of
    /// class or attribute. Called after creating objects under a label or ID
    /// so that cached negatives do not mask them.
    pub fn remove_by_value(&self, value: &[u8]) {
        self.lock()
            .searches
            .retain(|key, _| key.value != value);
    }

    /// Purge search entries whose cached result contains `object`.
    pub fn remove_by_object(&self, object: CK_OBJECT_HANDLE) {
        self.lock()
            .searches
            .retain(|_, handles| !handles.contains(&object));
    }

    /// Purge search entries containing `object` and every attribute entry
    /// read from it. Used when the object is destroyed.
    pub fn remove_all_by_object(&self, object: CK_OBJECT_HANDLE) {
        let mut entries = self.lock();
        entries.searches.retain(|_, handles| !handles.contains(&object));
        entries.attributes.retain(|key, _| key.object != object);
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.searches.clear();
        entries.attributes.clear();
    }

    /// True when a cache entry still references `object`; used by invariant
    /// tests.
    #[cfg(test)]
    pub fn references_object(&self, object: CK_OBJECT_HANDLE) -> bool {
        let entries = self.lock();
        entries.searches.values().any(|handles| handles.contains(&object))
            || entries.attributes.keys().any(|key| key.object == object)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.0.lock().expect("slot store mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use p11_sys::{CKA_ID, CKA_LABEL, CKO_CERTIFICATE, CKO_PRIVATE_KEY};

    use super::{AttributeKey, SearchKey, SlotStore};

    fn label_key(value: &[u8]) -> SearchKey {
        SearchKey {
            class: CKO_CERTIFICATE,
            attribute: CKA_LABEL,
            value: value.to_vec(),
        }
    }

    #[test]
    fn negative_result_is_cached_until_purged_by_value() {
        let store = SlotStore::new();
        store.add_objects(label_key(b"ca1"), &[]);
        assert_eq!(store.get_objects(&label_key(b"ca1")), Some(vec![]));

        store.remove_by_value(b"ca1");
        assert_eq!(store.get_objects(&label_key(b"ca1")), None);
    }

    #[test]
    fn destroying_an_object_drops_every_entry_referencing_it() {
        let store = SlotStore::new();
        store.add_objects(label_key(b"ca1"), &[7, 8]);
        store.add_objects(
            SearchKey {
                class: CKO_PRIVATE_KEY,
                attribute: CKA_ID,
                value: b"ca1".to_vec(),
            },
            &[9],
        );
        store.add_attribute(
            AttributeKey {
                object: 7,
                attribute: CKA_ID,
            },
            b"ca1",
        );

        store.remove_all_by_object(7);
        assert!(!store.references_object(7));
        assert_eq!(store.get_objects(&label_key(b"ca1")), None);
        assert!(store
            .get_objects(&SearchKey {
                class: CKO_PRIVATE_KEY,
                attribute: CKA_ID,
                value: b"ca1".to_vec(),
            })
            .is_some());
    }

    #[test]
    fn remove_by_object_keeps_attribute_entries() {
        let store = SlotStore::new();
        store.add_objects(label_key(b"k"), &[3]);
        store.add_attribute(
            AttributeKey {
                object: 3,
                attribute: CKA_ID,
            },
            b"k",
        );
        store.remove_by_object(3);
        assert_eq!(store.get_objects(&label_key(b"k")), None);
        assert!(store
            .get_attribute(&AttributeKey {
                object: 3,
                attribute: CKA_ID,
            })
            .is_some());
    }
}
