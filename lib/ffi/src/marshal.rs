// Conversions between caller-owned C data and owned Rust values, plus the
// free functions for everything this library hands back.

use quiver_core::{Error, ErrorCode, Metadata, Result};
use serde_json::Value;
use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr;

/// Optional C string. Null reads as `None`.
pub(crate) unsafe fn opt_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(Some)
        .map_err(|_| Error::InvalidArgument(format!("{} is not valid UTF-8", what)))
}

pub(crate) unsafe fn req_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    opt_str(ptr, what)?.ok_or_else(|| Error::InvalidArgument(format!("{} must not be null", what)))
}

/// Optional JSON text; null and blank both read as `None`
pub(crate) unsafe fn opt_json<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    Ok(opt_str(ptr, what)?.filter(|s| !s.trim().is_empty()))
}

pub(crate) fn parse_metadata(json: &str) -> Result<Metadata> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Validation("metadata must be a JSON object".to_string())),
        Err(e) => Err(Error::Validation(format!("invalid metadata JSON: {}", e))),
    }
}

pub(crate) unsafe fn str_array(ptr: *const *const c_char, count: usize, what: &str) -> Result<Vec<String>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{} must not be null", what)));
    }
    std::slice::from_raw_parts(ptr, count)
        .iter()
        .map(|&item| req_str(item, what).map(str::to_string))
        .collect()
}

/// A nullable array whose entries may themselves be null
pub(crate) unsafe fn opt_str_array(
    ptr: *const *const c_char,
    count: usize,
    what: &str,
) -> Result<Option<Vec<Option<String>>>> {
    if ptr.is_null() {
        return Ok(None);
    }
    std::slice::from_raw_parts(ptr, count)
        .iter()
        .map(|&item| opt_str(item, what).map(|s| s.map(str::to_string)))
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

pub(crate) unsafe fn metadata_array(
    ptr: *const *const c_char,
    count: usize,
) -> Result<Option<Vec<Option<Metadata>>>> {
    let Some(raw) = opt_str_array(ptr, count, "metadatas")? else {
        return Ok(None);
    };
    raw.into_iter()
        .map(|item| match item.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(json) => parse_metadata(json).map(Some),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// `count` rows of `dim` floats, one pointer per row
pub(crate) unsafe fn embedding_rows(ptr: *const *const f32, count: usize, dim: usize) -> Result<Vec<Vec<f32>>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if ptr.is_null() {
        return Err(Error::InvalidArgument("embeddings must not be null".to_string()));
    }
    if dim == 0 {
        return Err(Error::InvalidArgument("embedding_dim must be positive".to_string()));
    }
    std::slice::from_raw_parts(ptr, count)
        .iter()
        .map(|&row| {
            if row.is_null() {
                Err(Error::InvalidArgument("embedding row must not be null".to_string()))
            } else {
                Ok(std::slice::from_raw_parts(row, dim).to_vec())
            }
        })
        .collect()
}

pub(crate) unsafe fn embedding(ptr: *const f32, dim: usize) -> Result<Vec<f32>> {
    if ptr.is_null() || dim == 0 {
        return Err(Error::InvalidArgument(
            "query embedding must be non-null with a positive dimension".to_string(),
        ));
    }
    Ok(std::slice::from_raw_parts(ptr, dim).to_vec())
}

pub(crate) unsafe fn handle<'a, T>(ptr: *const T, what: &str) -> Result<&'a T> {
    ptr.as_ref()
        .ok_or_else(|| Error::InvalidArgument(format!("{} handle must not be null", what)))
}

/// Store `value` through an out-pointer supplied by the caller
pub(crate) unsafe fn write_out<T>(out: *mut T, value: T) -> Result<()> {
    if out.is_null() {
        return Err(Error::InvalidArgument("output pointer must not be null".to_string()));
    }
    out.write(value);
    Ok(())
}

pub(crate) unsafe fn check_out<T>(out: *mut T) -> Result<()> {
    if out.is_null() {
        return Err(Error::InvalidArgument("output pointer must not be null".to_string()));
    }
    Ok(())
}

pub(crate) fn to_c_string(s: &str) -> Result<*mut c_char> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|_| Error::Internal("string contains an interior NUL byte".to_string()))
}

fn reserve<T>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| Error::Memory(format!("cannot allocate {} result entries: {}", len, e)))?;
    Ok(v)
}

/// Leak a vector as a C array; returns null for an empty one
pub(crate) fn leak_vec<T>(v: Vec<T>) -> *mut T {
    if v.is_empty() {
        return ptr::null_mut();
    }
    Box::into_raw(v.into_boxed_slice()) as *mut T
}

/// Owned strings as a C array of C strings. `None` entries become null.
pub(crate) fn string_array<I, S>(items: I, len: usize) -> Result<*mut *mut c_char>
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let mut out: Vec<*mut c_char> = reserve(len)?;
    for item in items {
        let converted = match item {
            Some(s) => to_c_string(s.as_ref()),
            None => Ok(ptr::null_mut()),
        };
        match converted {
            Ok(p) => out.push(p),
            Err(e) => {
                for p in out {
                    free_c_string(p);
                }
                return Err(e);
            }
        }
    }
    Ok(leak_vec(out))
}

pub(crate) fn float_array(values: impl IntoIterator<Item = f32>, len: usize) -> Result<*mut f32> {
    let mut out: Vec<f32> = reserve(len)?;
    out.extend(values);
    Ok(leak_vec(out))
}

fn free_c_string(p: *mut c_char) {
    if !p.is_null() {
        drop(unsafe { CString::from_raw(p) });
    }
}

pub(crate) unsafe fn free_array<T>(ptr: *mut T, count: usize) {
    if !ptr.is_null() && count > 0 {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, count)));
    }
}

pub(crate) unsafe fn free_string_array_raw(array: *mut *mut c_char, count: usize) {
    if array.is_null() {
        return;
    }
    for &p in std::slice::from_raw_parts(array, count) {
        free_c_string(p);
    }
    free_array(array, count);
}

/// Free a string returned by this library. Null is accepted.
#[no_mangle]
pub unsafe extern "C" fn quiver_free_string(s: *mut c_char) -> c_int {
    free_c_string(s);
    ErrorCode::Success as c_int
}

/// Free an array of `count` strings returned by this library
#[no_mangle]
pub unsafe extern "C" fn quiver_free_string_array(array: *mut *mut c_char, count: usize) -> c_int {
    free_string_array_raw(array, count);
    ErrorCode::Success as c_int
}
