use std::sync::Arc;

/// Opaque handle to a monitored host, as resolved by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHandle {
    pub hostname: Arc<str>,
    pub is_base: bool,
}

impl HostHandle {
    pub fn base(hostname: &str) -> Self {
        Self {
            hostname: Arc::from(hostname),
            is_base: true,
        }
    }

    pub fn secondary(hostname: &str) -> Self {
        Self {
            hostname: Arc::from(hostname),
            is_base: false,
        }
    }
}

/// Host lookup surface used by `/host/<name>/...` and
/// `/node/<id>/...` switching. The agent's host database sits behind
/// this trait; the engine only needs the three lookups.
pub trait HostRegistry: Send + Sync {
    fn base_host(&self) -> HostHandle;
    fn by_hostname(&self, name: &str) -> Option<HostHandle>;
    fn by_guid(&self, guid: &str) -> Option<HostHandle>;
    fn by_node_id(&self, id: &str) -> Option<HostHandle>;
}

/// Registry of a standalone agent: only the base host exists.
pub struct SingleHostRegistry {
    base: HostHandle,
}

impl SingleHostRegistry {
    pub fn new(hostname: &str) -> Self {
        Self {
            base: HostHandle::base(hostname),
        }
    }
}

impl HostRegistry for SingleHostRegistry {
    fn base_host(&self) -> HostHandle {
        self.base.clone()
    }

    fn by_hostname(&self, name: &str) -> Option<HostHandle> {
        (name == &*self.base.hostname).then(|| self.base.clone())
    }

    fn by_guid(&self, _guid: &str) -> Option<HostHandle> {
        None
    }

    fn by_node_id(&self, _id: &str) -> Option<HostHandle> {
        None
    }
}

/// Lower-case a textual GUID if it is one, for the case-mismatch
/// retry of the host lookup. Returns None when the token is not a
/// well-formed GUID.
pub fn normalize_guid(token: &str) -> Option<String> {
    let b = token.as_bytes();
    if b.len() != 36 {
        return None;
    }
    for (i, &c) in b.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if c != b'-' {
                    return None;
                }
            }
            _ => {
                if !c.is_ascii_hexdigit() {
                    return None;
                }
            }
        }
    }
    Some(token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_host_lookups() {
        let r = SingleHostRegistry::new("agent-1");
        assert!(r.base_host().is_base);
        assert!(r.by_hostname("agent-1").is_some());
        assert!(r.by_hostname("other").is_none());
        assert!(r.by_guid("x").is_none());
    }

    #[test]
    fn guid_normalization() {
        assert_eq!(
            normalize_guid("6FC56A64-05D7-47A7-BC82-7F3235D8CBCB").as_deref(),
            Some("6fc56a64-05d7-47a7-bc82-7f3235d8cbcb")
        );
        assert!(normalize_guid("not-a-guid").is_none());
        assert!(normalize_guid("6FC56A64x05D7-47A7-BC82-7F3235D8CBCB").is_none());
    }
}
