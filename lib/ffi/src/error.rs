use quiver_core::{Error, ErrorCode, Result};
use std::cell::RefCell;
use std::ffi::{c_char, c_int, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one entry point: translate its result into a status code, record
/// the failure message for this thread, and keep panics from crossing the
/// boundary.
pub(crate) fn guard<F>(op: &'static str, f: F) -> c_int
where
    F: FnOnce() -> Result<()>,
{
    clear_last_error();
    let outcome = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(Error::Internal(format!("panic in {}: {}", op, panic_message(payload.as_ref()))))
    });
    match outcome {
        Ok(()) => ErrorCode::Success as c_int,
        Err(e) => {
            let code = e.code();
            error!(op, code = code as i32, "{}", e);
            set_last_error(e.to_string());
            code as c_int
        }
    }
}

/// Detail of the last failure on the calling thread, or null if the last
/// call succeeded. Free with `quiver_free_string`.
#[no_mangle]
pub extern "C" fn quiver_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_deref()
            .and_then(|message| CString::new(message.replace('\0', " ")).ok())
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::quiver_free_string;
    use std::ffi::CStr;

    #[test]
    fn test_guard_maps_errors_and_panics() {
        assert_eq!(guard("ok", || Ok(())), 0);
        assert!(quiver_last_error_message().is_null());

        assert_eq!(
            guard("missing", || Err(Error::CollectionNotFound("c".to_string()))),
            ErrorCode::NotFound as c_int
        );
        let message = quiver_last_error_message();
        assert!(!message.is_null());
        let text = unsafe { CStr::from_ptr(message) }.to_str().unwrap().to_string();
        assert!(text.contains("Collection not found"));
        unsafe { quiver_free_string(message) };

        let code = guard("boom", || -> Result<()> { panic!("kaboom") });
        assert_eq!(code, ErrorCode::InternalError as c_int);
    }
}
