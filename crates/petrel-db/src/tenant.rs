use std::hash::Hasher;
use std::sync::Arc;

use siphasher::sip::SipHasher24;
use uuid::Uuid;

use crate::{Error, Store};

/// The opaque per-tenant authorization key.
///
/// The key authenticates index files: an index written for a tenant
/// carries a MAC keyed by this value, and loads verify it before
/// decoding. The raw bytes never appear in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct TenantKey([u8; 32]);

impl TenantKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the SipHash key pair used to MAC index files.
    pub(crate) fn sip_keys(&self) -> (u64, u64) {
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&self.0[..8]);
        k1.copy_from_slice(&self.0[8..16]);
        (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
    }

    pub(crate) fn mac(&self, data: &[u8]) -> u64 {
        let (k0, k1) = self.sip_keys();
        let mut hasher = SipHasher24::new_with_keys(k0, k1);
        hasher.write(data);
        hasher.finish()
    }
}

impl std::fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TenantKey(..)")
    }
}

/// A tenant identity: who is asking, with what key, against which root.
pub trait Tenant: Send + Sync {
    /// Worker/tenant id carried into remote transports.
    fn id(&self) -> Uuid;

    fn key(&self) -> &TenantKey;

    /// The tenant's storage root. Fails if the tenant's backing store
    /// cannot be used for reading.
    fn root(&self) -> error_stack::Result<Arc<dyn Store>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_is_keyed() {
        let a = TenantKey::new([1u8; 32]);
        let b = TenantKey::new([2u8; 32]);
        assert_ne!(a.mac(b"payload"), b.mac(b"payload"));
        assert_eq!(a.mac(b"payload"), a.mac(b"payload"));
    }

    #[test]
    fn test_debug_redacts() {
        let key = TenantKey::new([7u8; 32]);
        assert_eq!(format!("{key:?}"), "TenantKey(..)");
    }
}
