//! Process hardening for key material

use crate::error::{CryptoError, Result};

/// Prevent core dumps from being generated
///
/// Reduces the risk of key material being written to disk if the process
/// crashes.
///
/// # Platform Support
///
/// - **Unix**: `setrlimit(RLIMIT_CORE, 0)`
/// - **Other**: no-op
#[allow(unsafe_code)]
pub fn prevent_core_dumps() -> Result<()> {
    #[cfg(unix)]
    {
        use std::io;
        // SAFETY: setrlimit with RLIMIT_CORE=0 is a non-destructive call
        // with valid stack-local arguments.
        unsafe {
            let rlim = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &rlim) != 0 {
                return Err(CryptoError::Io(io::Error::last_os_error().to_string()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prevent_core_dumps() {
        // Should not panic; may fail in restricted sandboxes
        let _ = prevent_core_dumps();
    }
}
