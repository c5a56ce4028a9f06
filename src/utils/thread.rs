#![allow(unused)]

use anyhow::{Result, anyhow};
use std::ffi::CStr;

const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Gets the name of the current thread.
///
/// This uses `pthread_getname_np` on Linux, the counterpart of the name the
/// thread builder sets via `pthread_setname_np`. Note that names longer than
/// 15 bytes arrive truncated.
#[cfg(target_os = "linux")]
pub(crate) fn get_current_thread_name() -> Result<String> {
    // Zero-initialized, so the buffer is guaranteed to be null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return Err(anyhow!(
            "pthread_getname_np failed with error code: {}",
            ret
        ));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("Failed to convert thread name from CStr: {}", e))
}
