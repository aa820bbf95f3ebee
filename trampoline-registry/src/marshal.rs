//! String marshaling helpers for calls through native addresses
//!
//! Generated call-forwarding code uses these to pass strings and string
//! arrays to native functions and to copy native strings back.

use crate::types::{BridgeError, Result};
use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// Convert a Rust string to an owned NUL-terminated C string.
///
/// A single trailing NUL is accepted and not duplicated.
///
/// # Errors
/// * `InvalidString` if the string contains an interior NUL byte
pub fn to_c_string(s: &str) -> Result<CString> {
    let bytes = s.strip_suffix('\0').unwrap_or(s);
    CString::new(bytes).map_err(|e| BridgeError::InvalidString(e.to_string()))
}

/// Like [`to_c_string`], with `None` mapping to a null pointer on the native side
pub fn nullable_to_c_string(s: Option<&str>) -> Result<Option<CString>> {
    s.map(to_c_string).transpose()
}

/// Pointer for an optional C string (`NULL` for `None`)
pub fn nullable_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

/// Owned NULL-terminated `char**` array
pub struct CStringArray {
    // Owns the storage the pointers below point into.
    _strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

impl CStringArray {
    /// Build the array from Rust strings
    ///
    /// # Errors
    /// * `InvalidString` if any element contains an interior NUL byte
    pub fn new<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let strings = items
            .iter()
            .map(|item| to_c_string(item.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let mut pointers: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        pointers.push(ptr::null());
        Ok(Self {
            _strings: strings,
            pointers,
        })
    }

    /// Pointer to the first element; valid while `self` is alive
    pub fn as_ptr(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }

    /// Number of strings, not counting the terminating NULL
    pub fn len(&self) -> usize {
        self.pointers.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copy a native C string. A null pointer yields an empty string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
pub unsafe fn from_c_str(ptr: *const c_char) -> String {
    from_nullable_c_str(ptr).unwrap_or_default()
}

/// Copy a native C string, mapping a null pointer to `None`
///
/// # Safety
/// Same as [`from_c_str`].
pub unsafe fn from_nullable_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Copy a NULL-terminated native `char**` array
///
/// # Safety
/// `array` must be null or point to a NULL-terminated array of valid C strings.
pub unsafe fn from_c_str_array(array: *const *const c_char) -> Vec<String> {
    let mut strings = Vec::new();
    if array.is_null() {
        return strings;
    }
    let mut index = 0;
    loop {
        let item = *array.add(index);
        if item.is_null() {
            break;
        }
        strings.push(from_c_str(item));
        index += 1;
    }
    strings
}
