//! `libloading`-backed implementation of [`Pkcs11Api`].
//!
//! Symbols are resolved once at load time into a struct of function pointers.
//! The two vendor entry points are optional; a library without them still
//! loads, and calls into them fail with `FunctionUnavailable`.

#![allow(non_snake_case)]

use std::ptr;

use libloading::Library;
use p11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_C_AuthorizeKey, CK_C_AuthorizeKeyInit,
    CK_C_CloseSession, CK_C_CreateObject, CK_C_DestroyObject, CK_C_FindObjects,
    CK_C_FindObjectsFinal, CK_C_FindObjectsInit, CK_C_Finalize, CK_C_GenerateKey,
    CK_C_GenerateKeyPair, CK_C_GetAttributeValue, CK_C_GetMechanismList, CK_C_GetSlotList,
    CK_C_GetTokenInfo, CK_C_INITIALIZE_ARGS, CK_C_Initialize, CK_C_Login, CK_C_Logout,
    CK_C_OpenSession, CK_C_Sign, CK_C_SignInit, CK_C_UnwrapKey, CK_C_WrapKey, CK_FALSE, CK_FLAGS,
    CK_MECHANISM, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID,
    CK_TOKEN_INFO, CK_TRUE, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE,
    CKF_OS_LOCKING_OK, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_OK,
};
use tracing::{info, trace};

use crate::{
    api::Pkcs11Api,
    attribute::Template,
    error::{P11Error, P11Result},
};

/// How many handles `C_FindObjects` is asked for per round trip.
const FIND_OBJECTS_CHUNK: usize = 64;

macro_rules! ck_call {
    ($self:expr, $fn_name:ident $(, $args:expr)*) => {{
        let rv = match $self.$fn_name {
            Some(func) => unsafe { func($($args),*) },
            None => return Err(P11Error::FunctionUnavailable(stringify!($fn_name))),
        };
        if rv != CKR_OK {
            return Err(P11Error::cryptoki(stringify!($fn_name), rv));
        }
    }};
}

/// One loaded Cryptoki module. Finalized when dropped.
pub struct Pkcs11Library {
    _library: Library,
    C_Initialize: CK_C_Initialize,
    C_Finalize: CK_C_Finalize,
    C_GetSlotList: CK_C_GetSlotList,
    C_GetTokenInfo: CK_C_GetTokenInfo,
    C_GetMechanismList: CK_C_GetMechanismList,
    C_OpenSession: CK_C_OpenSession,
    C_CloseSession: CK_C_CloseSession,
    C_Login: CK_C_Login,
    C_Logout: CK_C_Logout,
    C_CreateObject: CK_C_CreateObject,
    C_DestroyObject: CK_C_DestroyObject,
    C_GetAttributeValue: CK_C_GetAttributeValue,
    C_FindObjectsInit: CK_C_FindObjectsInit,
    C_FindObjects: CK_C_FindObjects,
    C_FindObjectsFinal: CK_C_FindObjectsFinal,
    C_GenerateKey: CK_C_GenerateKey,
    C_GenerateKeyPair: CK_C_GenerateKeyPair,
    C_WrapKey: CK_C_WrapKey,
    C_UnwrapKey: CK_C_UnwrapKey,
    C_SignInit: CK_C_SignInit,
    C_Sign: CK_C_Sign,
    C_AuthorizeKeyInit: CK_C_AuthorizeKeyInit,
    C_AuthorizeKey: CK_C_AuthorizeKey,
}

impl Pkcs11Library {
    /// Load the module at `path` and resolve the Cryptoki symbols.
    ///
    /// # Errors
    /// Fails if the module cannot be loaded or a mandatory symbol is missing.
    pub fn load<P: AsRef<std::ffi::OsStr>>(path: P) -> P11Result<Self> {
        unsafe {
            let library = Library::new(path)?;
            Ok(Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo")?),
                C_GetMechanismList: Some(*library.get(b"C_GetMechanismList")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_CreateObject: Some(*library.get(b"C_CreateObject")?),
                C_DestroyObject: Some(*library.get(b"C_DestroyObject")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_GenerateKey: Some(*library.get(b"C_GenerateKey")?),
                C_GenerateKeyPair: Some(*library.get(b"C_GenerateKeyPair")?),
                C_WrapKey: Some(*library.get(b"C_WrapKey")?),
                C_UnwrapKey: Some(*library.get(b"C_UnwrapKey")?),
                C_SignInit: Some(*library.get(b"C_SignInit")?),
                C_Sign: Some(*library.get(b"C_Sign")?),
                // Vendor extension; absent on most modules.
                C_AuthorizeKeyInit: library.get(b"C_AuthorizeKeyInit").map(|s| *s).ok(),
                C_AuthorizeKey: library.get(b"C_AuthorizeKey").map(|s| *s).ok(),
                // keep the module mapped for as long as the pointers live
                _library: library,
            })
        }
    }
}

impl Drop for Pkcs11Library {
    fn drop(&mut self) {
        if let Some(func) = self.C_Finalize {
            let rv = unsafe { func(ptr::null_mut()) };
            if rv != CKR_OK {
                trace!("C_Finalize returned 0x{rv:08x}");
            }
        }
    }
}

impl Pkcs11Api for Pkcs11Library {
    fn initialize(&self) -> P11Result<()> {
        let args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let func = self
            .C_Initialize
            .ok_or(P11Error::FunctionUnavailable("C_Initialize"))?;
        let rv = unsafe { func(ptr::from_ref(&args).cast_mut().cast()) };
        match rv {
            CKR_OK => Ok(()),
            CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                info!("Cryptoki already initialized");
                Ok(())
            }
            rv => Err(P11Error::cryptoki("C_Initialize", rv)),
        }
    }

    fn finalize(&self) -> P11Result<()> {
        ck_call!(self, C_Finalize, ptr::null_mut());
        Ok(())
    }

    fn get_slot_list(&self, token_present: bool) -> P11Result<Vec<CK_SLOT_ID>> {
        let token_present: CK_BBOOL = if token_present { CK_TRUE } else { CK_FALSE };
        let mut count: CK_ULONG = 0;
        ck_call!(
            self,
            C_GetSlotList,
            token_present,
            ptr::null_mut(),
            &raw mut count
        );
        let mut slots = vec![CK_SLOT_ID::default(); count as usize];
        ck_call!(
            self,
            C_GetSlotList,
            token_present,
            slots.as_mut_ptr(),
            &raw mut count
        );
        slots.truncate(count as usize);
        trace!("C_GetSlotList: {slots:?}");
        Ok(slots)
    }

    fn get_token_info(&self, slot_id: CK_SLOT_ID) -> P11Result<CK_TOKEN_INFO> {
        let mut info = CK_TOKEN_INFO::default();
        ck_call!(self, C_GetTokenInfo, slot_id, &raw mut info);
        Ok(info)
    }

    fn get_mechanism_list(&self, slot_id: CK_SLOT_ID) -> P11Result<Vec<CK_MECHANISM_TYPE>> {
        let mut count: CK_ULONG = 0;
        ck_call!(
            self,
            C_GetMechanismList,
            slot_id,
            ptr::null_mut(),
            &raw mut count
        );
        let mut mechanisms = vec![CK_MECHANISM_TYPE::default(); count as usize];
        ck_call!(
            self,
            C_GetMechanismList,
            slot_id,
            mechanisms.as_mut_ptr(),
            &raw mut count
        );
        mechanisms.truncate(count as usize);
        Ok(mechanisms)
    }

    fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> P11Result<CK_SESSION_HANDLE> {
        let mut session: CK_SESSION_HANDLE = 0;
        ck_call!(
            self,
            C_OpenSession,
            slot_id,
            flags,
            ptr::null_mut(),
            None,
            &raw mut session
        );
        trace!("C_OpenSession: {session}");
        Ok(session)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> P11Result<()> {
        trace!("C_CloseSession({session})");
        ck_call!(self, C_CloseSession, session);
        Ok(())
    }

    fn login(&self, session: CK_SESSION_HANDLE, user: CK_USER_TYPE, pin: &[u8]) -> P11Result<()> {
        let mut pin = zeroize::Zeroizing::new(pin.to_vec());
        ck_call!(
            self,
            C_Login,
            session,
            user,
            pin.as_mut_ptr(),
            pin.len() as CK_ULONG
        );
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> P11Result<()> {
        ck_call!(self, C_Logout, session);
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &Template,
    ) -> P11Result<Vec<CK_OBJECT_HANDLE>> {
        let mut raw_template = template.to_raw();
        ck_call!(
            self,
            C_FindObjectsInit,
            session,
            raw_template.as_mut_ptr(),
            raw_template.len()
        );
        let mut handles = Vec::new();
        let mut chunk = vec![CK_OBJECT_HANDLE::default(); FIND_OBJECTS_CHUNK];
        loop {
            let mut found: CK_ULONG = 0;
            ck_call!(
                self,
                C_FindObjects,
                session,
                chunk.as_mut_ptr(),
                FIND_OBJECTS_CHUNK as CK_ULONG,
                &raw mut found
            );
            if found == 0 {
                break;
            }
            handles.extend_from_slice(&chunk[..found as usize]);
        }
        ck_call!(self, C_FindObjectsFinal, session);
        trace!("C_FindObjects: {} match(es)", handles.len());
        Ok(handles)
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
        let func = self
            .C_GetAttributeValue
            .ok_or(P11Error::FunctionUnavailable("C_GetAttributeValue"))?;

        // First pass sizes the buffers. Unknown and sensitive attributes are
        // reported per entry, not as a call failure.
        let mut attrs: Vec<CK_ATTRIBUTE> = attributes
            .iter()
            .map(|&type_| CK_ATTRIBUTE {
                type_,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            })
            .collect();
        let rv = unsafe { func(session, object, attrs.as_mut_ptr(), attrs.len() as CK_ULONG) };
        if rv != CKR_OK && rv != CKR_ATTRIBUTE_TYPE_INVALID && rv != CKR_ATTRIBUTE_SENSITIVE {
            return Err(P11Error::cryptoki("C_GetAttributeValue", rv));
        }

        let mut buffers: Vec<Option<Vec<u8>>> = attrs
            .iter()
            .map(|attr| {
                if attr.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                    None
                } else {
                    Some(vec![0_u8; attr.ulValueLen as usize])
                }
            })
            .collect();
        for (attr, buffer) in attrs.iter_mut().zip(buffers.iter_mut()) {
            if let Some(buffer) = buffer {
                attr.pValue = buffer.as_mut_ptr().cast();
            }
        }
        let rv = unsafe { func(session, object, attrs.as_mut_ptr(), attrs.len() as CK_ULONG) };
        if rv != CKR_OK && rv != CKR_ATTRIBUTE_TYPE_INVALID && rv != CKR_ATTRIBUTE_SENSITIVE {
            return Err(P11Error::cryptoki("C_GetAttributeValue", rv));
        }
        for (attr, buffer) in attrs.iter().zip(buffers.iter_mut()) {
            if attr.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                *buffer = None;
            } else if let Some(buffer) = buffer {
                buffer.truncate(attr.ulValueLen as usize);
            }
        }
        Ok(buffers)
    }

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE> {
        let mut raw_template = template.to_raw();
        let mut object: CK_OBJECT_HANDLE = 0;
        ck_call!(
            self,
            C_CreateObject,
            session,
            raw_template.as_mut_ptr(),
            raw_template.len(),
            &raw mut object
        );
        Ok(object)
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> P11Result<()> {
        trace!("C_DestroyObject({session}, {object})");
        ck_call!(self, C_DestroyObject, session, object);
        Ok(())
    }

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            ..CK_MECHANISM::default()
        };
        let mut raw_template = template.to_raw();
        let mut object: CK_OBJECT_HANDLE = 0;
        ck_call!(
            self,
            C_GenerateKey,
            session,
            &raw mut mechanism,
            raw_template.as_mut_ptr(),
            raw_template.len(),
            &raw mut object
        );
        Ok(object)
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        public_template: &Template,
        private_template: &Template,
    ) -> P11Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            ..CK_MECHANISM::default()
        };
        let mut raw_public = public_template.to_raw();
        let mut raw_private = private_template.to_raw();
        let mut public: CK_OBJECT_HANDLE = 0;
        let mut private: CK_OBJECT_HANDLE = 0;
        ck_call!(
            self,
            C_GenerateKeyPair,
            session,
            &raw mut mechanism,
            raw_public.as_mut_ptr(),
            raw_public.len(),
            raw_private.as_mut_ptr(),
            raw_private.len(),
            &raw mut public,
            &raw mut private
        );
        Ok((public, private))
    }

    fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
    ) -> P11Result<Vec<u8>> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            ..CK_MECHANISM::default()
        };
        let mut wrapped_len: CK_ULONG = 0;
        ck_call!(
            self,
            C_WrapKey,
            session,
            &raw mut mechanism,
            wrapping_key,
            key,
            ptr::null_mut(),
            &raw mut wrapped_len
        );
        let mut wrapped = vec![0_u8; wrapped_len as usize];
        ck_call!(
            self,
            C_WrapKey,
            session,
            &raw mut mechanism,
            wrapping_key,
            key,
            wrapped.as_mut_ptr(),
            &raw mut wrapped_len
        );
        wrapped.truncate(wrapped_len as usize);
        Ok(wrapped)
    }

    fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        unwrapping_key: CK_OBJECT_HANDLE,
        wrapped: &[u8],
        template: &Template,
    ) -> P11Result<CK_OBJECT_HANDLE> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            ..CK_MECHANISM::default()
        };
        let mut wrapped = wrapped.to_vec();
        let mut raw_template = template.to_raw();
        let mut object: CK_OBJECT_HANDLE = 0;
        ck_call!(
            self,
            C_UnwrapKey,
            session,
            &raw mut mechanism,
            unwrapping_key,
            wrapped.as_mut_ptr(),
            wrapped.len() as CK_ULONG,
            raw_template.as_mut_ptr(),
            raw_template.len(),
            &raw mut object
        );
        Ok(object)
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        key: CK_OBJECT_HANDLE,
    ) -> P11Result<()> {
        let mut mechanism = CK_MECHANISM {
            mechanism,
            ..CK_MECHANISM::default()
        };
        ck_call!(self, C_SignInit, session, &raw mut mechanism, key);
        Ok(())
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> P11Result<Vec<u8>> {
        let mut data = data.to_vec();
        let mut signature_len: CK_ULONG = 0;
        ck_call!(
            self,
            C_Sign,
            session,
            data.as_mut_ptr(),
            data.len() as CK_ULONG,
            ptr::null_mut(),
            &raw mut signature_len
        );
        let mut signature = vec![0_u8; signature_len as usize];
        ck_call!(
            self,
            C_Sign,
            session,
            data.as_mut_ptr(),
            data.len() as CK_ULONG,
            signature.as_mut_ptr(),
            &raw mut signature_len
        );
        signature.truncate(signature_len as usize);
        Ok(signature)
    }

    fn authorize_key_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &CK_MECHANISM,
        key: CK_OBJECT_HANDLE,
        hash_len: usize,
    ) -> P11Result<Vec<u8>> {
        let mut mechanism = *mechanism;
        let mut hash = vec![0_u8; hash_len];
        let mut returned_len = hash_len as CK_ULONG;
        ck_call!(
            self,
            C_AuthorizeKeyInit,
            session,
            &raw mut mechanism,
            key,
            hash.as_mut_ptr(),
            &raw mut returned_len
        );
        hash.truncate(returned_len as usize);
        Ok(hash)
    }

    fn authorize_key(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> P11Result<()> {
        let mut signature = signature.to_vec();
        ck_call!(
            self,
            C_AuthorizeKey,
            session,
            signature.as_mut_ptr(),
            signature.len() as CK_ULONG
        );
        Ok(())
    }
}
