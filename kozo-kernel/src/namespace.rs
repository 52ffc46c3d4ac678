//! Service namespace
//!
//! A deliberately trivial string-registration hook: services publish an
//! endpoint under a short name ("system.policy") so their peers can find
//! it without a prior capability exchange. Anything richer — access
//! control on names, enumeration, hierarchies — belongs in a user-mode
//! naming service built on top of this.

use kozo_syscall::SysError;
use spin::Mutex;

use crate::ipc::EndpointId;

/// Maximum registered name length in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum number of registered names.
pub const MAX_NAMES: usize = 32;

#[derive(Clone, Copy)]
struct NameEntry {
    used: bool,
    name: [u8; MAX_NAME_LEN],
    len: u8,
    endpoint: EndpointId,
}

impl NameEntry {
    const fn empty() -> Self {
        Self {
            used: false,
            name: [0; MAX_NAME_LEN],
            len: 0,
            endpoint: 0,
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.used && &self.name[..self.len as usize] == name.as_bytes()
    }
}

static NAMES: Mutex<[NameEntry; MAX_NAMES]> = Mutex::new([NameEntry::empty(); MAX_NAMES]);

/// Register an endpoint under `name`. Duplicate names are refused.
pub fn register(name: &str, endpoint: EndpointId) -> Result<(), SysError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(SysError::Invalid);
    }
    let mut table = NAMES.lock();
    if table.iter().any(|e| e.matches(name)) {
        return Err(SysError::NoSpace);
    }
    for entry in table.iter_mut() {
        if !entry.used {
            entry.used = true;
            entry.len = name.len() as u8;
            entry.name[..name.len()].copy_from_slice(name.as_bytes());
            entry.endpoint = endpoint;
            log::info!("namespace: '{name}' -> endpoint {endpoint}");
            return Ok(());
        }
    }
    Err(SysError::NoSpace)
}

/// Look up an endpoint by name.
#[must_use]
pub fn lookup(name: &str) -> Option<EndpointId> {
    NAMES
        .lock()
        .iter()
        .find(|e| e.matches(name))
        .map(|e| e.endpoint)
}

/// Drop every registration pointing at a destroyed endpoint.
pub fn purge_endpoint(endpoint: EndpointId) {
    for entry in NAMES.lock().iter_mut() {
        if entry.used && entry.endpoint == endpoint {
            *entry = NameEntry::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The table is process-global; use distinct names per test.

    #[test]
    fn test_register_and_lookup() {
        register("test.alpha", 5).unwrap();
        assert_eq!(lookup("test.alpha"), Some(5));
        assert_eq!(lookup("test.absent"), None);
    }

    #[test]
    fn test_duplicate_rejected() {
        register("test.beta", 6).unwrap();
        assert_eq!(register("test.beta", 7), Err(SysError::NoSpace));
        assert_eq!(lookup("test.beta"), Some(6));
    }

    #[test]
    fn test_purge() {
        register("test.gamma", 8).unwrap();
        purge_endpoint(8);
        assert_eq!(lookup("test.gamma"), None);
    }

    #[test]
    fn test_bad_names() {
        assert_eq!(register("", 1), Err(SysError::Invalid));
        let long = core::str::from_utf8(&[b'x'; 33]).unwrap();
        assert_eq!(register(long, 1), Err(SysError::Invalid));
    }
}
