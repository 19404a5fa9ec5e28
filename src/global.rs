//! Init-once global broker handle.
//!
//! The embedding hypervisor builds the broker during single-CPU boot and
//! installs it here, so trap, hypercall and IPI glue can reach it without
//! threading a reference through every exception handler.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::registry::VirtioBroker;

struct BrokerCell {
    inner: UnsafeCell<Option<VirtioBroker>>,
    installed: AtomicBool,
}

// SAFETY: written once during single-threaded boot; the `installed` flag
// orders that write before any reader on another CPU.
unsafe impl Sync for BrokerCell {}

static BROKER: BrokerCell = BrokerCell {
    inner: UnsafeCell::new(None),
    installed: AtomicBool::new(false),
};

/// Install the boot-built broker. Must happen before any vCPU runs.
pub fn install(broker: VirtioBroker) {
    unsafe {
        let slot = &mut *BROKER.inner.get();
        if slot.is_some() {
            panic!("virtio broker already installed");
        }
        *slot = Some(broker);
    }
    BROKER.installed.store(true, Ordering::Release);
}

/// The installed broker.
pub fn broker() -> &'static VirtioBroker {
    if !BROKER.installed.load(Ordering::Acquire) {
        panic!("virtio broker not installed");
    }
    unsafe { (*BROKER.inner.get()).as_ref().unwrap() }
}
