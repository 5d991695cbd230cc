use std::sync::atomic::{AtomicBool, Ordering};

/// When set, relay pipes abort on their next iteration and no new traffic is
/// carried until the process restarts.
static EMERGENCY_LOCKDOWN: AtomicBool = AtomicBool::new(false);

pub fn set_lockdown(enabled: bool) {
    EMERGENCY_LOCKDOWN.store(enabled, Ordering::SeqCst);
    if enabled {
        tracing::warn!("emergency lockdown is now in effect");
    }
}

pub fn is_lockdown() -> bool {
    EMERGENCY_LOCKDOWN.load(Ordering::SeqCst)
}
