//! Named fault-injection switches for tests.
//!
//! A failpoint is enabled either for the current thread or process-wide
//! through `BEDROCK_FAILPOINTS` (comma separated names).

use std::cell::RefCell;
use std::collections::HashSet;

use crate::{BedrockError, Result};

/// Leaf writes leave the stored page checksum stale, as a torn write would.
pub const LEAF_SKIP_CHECKSUM: &str = "leaf_page_skip_checksum";

/// Table writes fail before touching any index.
pub const TABLE_WRITE_ERROR: &str = "table_write_error";

const ENV_VAR: &str = "BEDROCK_FAILPOINTS";

thread_local! {
    static ACTIVE: RefCell<HashSet<&'static str>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &'static str) {
    ACTIVE.with(|active| active.borrow_mut().insert(name));
}

pub fn disable(name: &'static str) {
    ACTIVE.with(|active| active.borrow_mut().remove(name));
}

/// Enables `name` on this thread until the guard drops.
pub fn scoped(name: &'static str) -> Scoped {
    enable(name);
    Scoped { name }
}

#[must_use = "the failpoint is disabled when the guard drops"]
pub struct Scoped {
    name: &'static str,
}

impl Drop for Scoped {
    fn drop(&mut self) {
        disable(self.name);
    }
}

pub fn is_enabled(name: &str) -> bool {
    if ACTIVE.with(|active| active.borrow().contains(name)) {
        return true;
    }
    match std::env::var(ENV_VAR) {
        Ok(raw) => raw.split(',').any(|v| v.trim() == name),
        Err(_) => false,
    }
}

/// Returns `Err(Failpoint)` when `name` is enabled.
pub fn maybe_fail(name: &str) -> Result<()> {
    if is_enabled(name) {
        log::debug!("failpoint {name} triggered");
        return Err(BedrockError::Failpoint(name.to_string()));
    }
    Ok(())
}
