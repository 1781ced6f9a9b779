//! Process-wide control entry.
//!
//! The kernel shim funnels its two IOCTLs here. Exactly one [`Vmm`]
//! exists per process; [`init`] installs it and [`start`]/[`stop`]
//! operate on it with the C-shaped status returns the shim expects.
//! Serialization of start against stop is a property of the external
//! control path, but the mutex makes it true here regardless.

use std::sync::{Mutex, OnceLock};

use crate::vmm::Vmm;

/// Control operation succeeded.
pub const LOADER_SUCCESS: i64 = 0;
/// Control operation failed.
pub const LOADER_FAILURE: i64 = -1;

static VMM: OnceLock<Mutex<Vmm>> = OnceLock::new();

/// Install the process-wide VMM instance. Fails if one is already
/// installed.
pub fn init(vmm: Vmm) -> Result<(), Vmm> {
    VMM.set(Mutex::new(vmm)).map_err(|m| m.into_inner().unwrap())
}

/// Handle a start request. `user_args` points at the packed request
/// record in user memory.
pub fn start(user_args: *const u8) -> i64 {
    let Some(vmm) = VMM.get() else {
        log::error!("start requested before the VMM was installed");
        return LOADER_FAILURE;
    };

    match vmm.lock().unwrap().start_from_user(user_args) {
        Ok(()) => LOADER_SUCCESS,
        Err(e) => {
            log::error!("start failed: {e}");
            LOADER_FAILURE
        }
    }
}

/// Handle a stop request.
pub fn stop() -> i64 {
    let Some(vmm) = VMM.get() else {
        log::error!("stop requested before the VMM was installed");
        return LOADER_FAILURE;
    };

    match vmm.lock().unwrap().stop() {
        Ok(()) => LOADER_SUCCESS,
        Err(e) => {
            log::error!("stop failed: {e}");
            LOADER_FAILURE
        }
    }
}
