//! Owned attribute templates and their marshalling into `CK_ATTRIBUTE` arrays.
//!
//! Templates own their value buffers; the raw array handed to the library
//! borrows from them, so a [`RawTemplate`] must outlive the native call it is
//! passed to.

use std::collections::BTreeMap;

use p11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_FALSE, CK_TRUE, CK_ULONG, CKA_ALWAYS_SENSITIVE,
    CKA_CERTIFICATE_TYPE, CKA_CLASS, CKA_DECRYPT, CKA_DERIVE, CKA_ENCRYPT, CKA_EXTRACTABLE,
    CKA_ID, CKA_ISSUER, CKA_KEY_TYPE, CKA_LABEL, CKA_MODIFIABLE, CKA_MODULUS, CKA_MODULUS_BITS,
    CKA_NEVER_EXTRACTABLE, CKA_PRIVATE, CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SERIAL_NUMBER,
    CKA_SIGN, CKA_SUBJECT, CKA_TOKEN, CKA_UNWRAP, CKA_VALUE, CKA_VALUE_LEN, CKA_VERIFY, CKA_WRAP,
};

/// A single attribute value in its typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
}

impl AttrValue {
    /// Encode the value as the byte buffer the library expects.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Bool(b) => vec![if *b { CK_TRUE } else { CK_FALSE }],
            Self::Ulong(v) => v.to_ne_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
        }
    }
}

/// Decode a `CK_ULONG` attribute blob.
pub(crate) fn decode_ulong(bytes: &[u8]) -> Option<CK_ULONG> {
    let raw: [u8; std::mem::size_of::<CK_ULONG>()] = bytes.try_into().ok()?;
    Some(CK_ULONG::from_ne_bytes(raw))
}

/// An attribute template. One value per attribute type; later inserts win,
/// which is what makes caller overrides merge on top of defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    entries: BTreeMap<CK_ATTRIBUTE_TYPE, AttrValue>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, type_: CK_ATTRIBUTE_TYPE, value: AttrValue) -> &mut Self {
        self.entries.insert(type_, value);
        self
    }

    #[must_use]
    pub fn bool(mut self, type_: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        self.entries.insert(type_, AttrValue::Bool(value));
        self
    }

    #[must_use]
    pub fn ulong(mut self, type_: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        self.entries.insert(type_, AttrValue::Ulong(value));
        self
    }

    #[must_use]
    pub fn bytes(mut self, type_: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(type_, AttrValue::Bytes(value.into()));
        self
    }

    /// Overlay `overrides` on top of this template; overriding entries win.
    pub fn merge(&mut self, overrides: &Self) {
        for (type_, value) in &overrides.entries {
            self.entries.insert(*type_, value.clone());
        }
    }

    pub fn get(&self, type_: CK_ATTRIBUTE_TYPE) -> Option<&AttrValue> {
        self.entries.get(&type_)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CK_ATTRIBUTE_TYPE, &AttrValue)> {
        self.entries.iter()
    }

    /// Marshal into an owned buffer set plus a `CK_ATTRIBUTE` array pointing
    /// into it.
    pub fn to_raw(&self) -> RawTemplate {
        let types: Vec<CK_ATTRIBUTE_TYPE> = self.entries.keys().copied().collect();
        let values: Vec<Vec<u8>> = self.entries.values().map(AttrValue::encode).collect();
        let attrs = types
            .iter()
            .zip(values.iter())
            .map(|(type_, value)| CK_ATTRIBUTE {
                type_: *type_,
                pValue: value.as_ptr().cast_mut().cast(),
                ulValueLen: value.len() as CK_ULONG,
            })
            .collect();
        RawTemplate {
            _values: values,
            attrs,
        }
    }
}

/// Marshalled template: `attrs` borrows from `_values`, so the struct must be
/// kept alive for the duration of the native call.
pub struct RawTemplate {
    _values: Vec<Vec<u8>>,
    attrs: Vec<CK_ATTRIBUTE>,
}

impl RawTemplate {
    pub fn as_mut_ptr(&mut self) -> *mut CK_ATTRIBUTE {
        self.attrs.as_mut_ptr()
    }

    pub fn len(&self) -> CK_ULONG {
        self.attrs.len() as CK_ULONG
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

pub(crate) fn attribute_name(type_: CK_ATTRIBUTE_TYPE) -> &'static str {
    match type_ {
        CKA_CLASS => "CKA_CLASS",
        CKA_TOKEN => "CKA_TOKEN",
        CKA_PRIVATE => "CKA_PRIVATE",
        CKA_LABEL => "CKA_LABEL",
        CKA_VALUE => "CKA_VALUE",
        CKA_CERTIFICATE_TYPE => "CKA_CERTIFICATE_TYPE",
        CKA_ISSUER => "CKA_ISSUER",
        CKA_SERIAL_NUMBER => "CKA_SERIAL_NUMBER",
        CKA_KEY_TYPE => "CKA_KEY_TYPE",
        CKA_SUBJECT => "CKA_SUBJECT",
        CKA_ID => "CKA_ID",
        CKA_SENSITIVE => "CKA_SENSITIVE",
        CKA_ENCRYPT => "CKA_ENCRYPT",
        CKA_DECRYPT => "CKA_DECRYPT",
        CKA_WRAP => "CKA_WRAP",
        CKA_UNWRAP => "CKA_UNWRAP",
        CKA_SIGN => "CKA_SIGN",
        CKA_VERIFY => "CKA_VERIFY",
        CKA_DERIVE => "CKA_DERIVE",
        CKA_MODULUS => "CKA_MODULUS",
        CKA_MODULUS_BITS => "CKA_MODULUS_BITS",
        CKA_PUBLIC_EXPONENT => "CKA_PUBLIC_EXPONENT",
        CKA_VALUE_LEN => "CKA_VALUE_LEN",
        CKA_EXTRACTABLE => "CKA_EXTRACTABLE",
        CKA_NEVER_EXTRACTABLE => "CKA_NEVER_EXTRACTABLE",
        CKA_ALWAYS_SENSITIVE => "CKA_ALWAYS_SENSITIVE",
        CKA_MODIFIABLE => "CKA_MODIFIABLE",
        _ => "CKA_?",
    }
}

#[cfg(test)]
mod tests {
    use p11_sys::{CKA_LABEL, CKA_MODULUS_BITS, CKA_TOKEN, CK_ULONG};

    use super::{AttrValue, Template, decode_ulong};

    #[test]
    fn merge_lets_overrides_win() {
        let mut template = Template::new()
            .bool(CKA_TOKEN, true)
            .ulong(CKA_MODULUS_BITS, 2048);
        let overrides = Template::new().ulong(CKA_MODULUS_BITS, 4096);
        template.merge(&overrides);
        assert_eq!(
            template.get(CKA_MODULUS_BITS),
            Some(&AttrValue::Ulong(4096))
        );
        assert_eq!(template.get(CKA_TOKEN), Some(&AttrValue::Bool(true)));
    }

    #[test]
    fn raw_template_points_at_encoded_values() {
        let template = Template::new()
            .bytes(CKA_LABEL, b"signer".to_vec())
            .bool(CKA_TOKEN, true);
        let mut raw = template.to_raw();
        assert_eq!(raw.len(), 2);
        assert!(!raw.as_mut_ptr().is_null());
    }

    #[test]
    fn scalar_round_trips() {
        assert_eq!(AttrValue::Bool(true).encode(), vec![1]);
        assert_eq!(
            decode_ulong(&AttrValue::Ulong(168).encode()),
            Some(168 as CK_ULONG)
        );
        assert_eq!(decode_ulong(&[1, 2]), None);
    }
}
