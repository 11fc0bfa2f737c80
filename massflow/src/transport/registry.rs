//! Channel addresses and the registry of bound endpoints.

use super::channel::{PullSocket, PushSocket};
use crate::errors::TransportError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

const NAMESPACE_LEN: usize = 16;
const NAMESPACE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A transport-local channel endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Creates an address from its string form.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns the address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two addresses owned by one stage.
///
/// Producers push into `frontend`; the stage's replicas pull from `backend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPair {
    /// Where producers connect.
    pub frontend: Address,
    /// Where the stage's replicas connect.
    pub backend: Address,
}

/// Hands out unique addresses inside one randomized namespace.
#[derive(Debug)]
pub struct AddressAllocator {
    prefix: String,
    namespace: String,
    next: usize,
}

impl AddressAllocator {
    /// Creates an allocator with a fresh random namespace below `root`.
    #[must_use]
    pub fn new(root: &str) -> Self {
        Self::with_namespace(root, random_namespace())
    }

    /// Creates an allocator with a fixed namespace.
    #[must_use]
    pub fn with_namespace(root: &str, namespace: impl Into<String>) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            prefix: format!("inproc://{root}"),
            namespace: namespace.into(),
            next: 0,
        }
    }

    /// Returns the namespace of this allocator.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Allocates the next address.
    pub fn allocate(&mut self) -> Address {
        let address = Address(format!("{}/{}/{}", self.prefix, self.namespace, self.next));
        self.next += 1;
        address
    }

    /// Allocates the address pair for one stage.
    pub fn allocate_pair(&mut self) -> ChannelPair {
        let backend = self.allocate();
        let frontend = self.allocate();
        ChannelPair { frontend, backend }
    }
}

fn random_namespace() -> String {
    let mut rng = rand::thread_rng();
    (0..NAMESPACE_LEN)
        .map(|_| NAMESPACE_ALPHABET[rng.gen_range(0..NAMESPACE_ALPHABET.len())] as char)
        .collect()
}

/// Registry of bound channel endpoints.
///
/// Relays bind endpoints; stage sockets connect to them by address. The frame
/// owns one registry and passes it by reference.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    push: DashMap<Address, PushSocket>,
    pull: DashMap<Address, PullSocket>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the push side of a channel at `address`.
    pub fn bind_push(&self, address: &Address, socket: PushSocket) -> Result<(), TransportError> {
        if self.pull.contains_key(address) {
            return Err(TransportError::AddressInUse(address.to_string()));
        }
        match self.push.entry(address.clone()) {
            Entry::Occupied(_) => Err(TransportError::AddressInUse(address.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(socket);
                Ok(())
            }
        }
    }

    /// Binds the pull side of a channel at `address`.
    pub fn bind_pull(&self, address: &Address, socket: PullSocket) -> Result<(), TransportError> {
        if self.push.contains_key(address) {
            return Err(TransportError::AddressInUse(address.to_string()));
        }
        match self.pull.entry(address.clone()) {
            Entry::Occupied(_) => Err(TransportError::AddressInUse(address.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(socket);
                Ok(())
            }
        }
    }

    /// Connects a push socket to the endpoint bound at `address`.
    pub fn connect_push(&self, address: &Address) -> Result<PushSocket, TransportError> {
        self.push
            .get(address)
            .map(|socket| socket.value().clone())
            .ok_or_else(|| TransportError::UnknownAddress(address.to_string()))
    }

    /// Connects a pull socket to the endpoint bound at `address`.
    pub fn connect_pull(&self, address: &Address) -> Result<PullSocket, TransportError> {
        self.pull
            .get(address)
            .map(|socket| socket.value().clone())
            .ok_or_else(|| TransportError::UnknownAddress(address.to_string()))
    }

    /// Returns true if anything is bound at `address`.
    #[must_use]
    pub fn is_bound(&self, address: &Address) -> bool {
        self.push.contains_key(address) || self.pull.contains_key(address)
    }

    /// Number of bound endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.push.len() + self.pull.len()
    }

    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;

    #[test]
    fn test_allocator_produces_unique_addresses() {
        let mut allocator = AddressAllocator::with_namespace("/tmp/mass_pipeline/", "ns");
        let first = allocator.allocate_pair();
        let second = allocator.allocate_pair();

        assert_eq!(first.backend.as_str(), "inproc:///tmp/mass_pipeline/ns/0");
        assert_eq!(first.frontend.as_str(), "inproc:///tmp/mass_pipeline/ns/1");
        assert_eq!(second.backend.as_str(), "inproc:///tmp/mass_pipeline/ns/2");
        assert_ne!(first.frontend, second.frontend);
    }

    #[test]
    fn test_random_namespace_shape() {
        let allocator = AddressAllocator::new("/tmp/mass_pipeline");
        assert_eq!(allocator.namespace().len(), NAMESPACE_LEN);
        assert!(allocator.namespace().chars().all(|c| c.is_ascii_alphabetic()));

        let other = AddressAllocator::new("/tmp/mass_pipeline");
        assert_ne!(allocator.namespace(), other.namespace());
    }

    #[test]
    fn test_bind_and_connect() {
        let registry = ChannelRegistry::new();
        let address = Address::new("inproc://test/0");
        let (push, pull) = channel(2);

        registry.bind_push(&address, push).unwrap();
        let connected = registry.connect_push(&address).unwrap();
        connected.send_blocking(vec![42]).unwrap();
        assert_eq!(pull.receive_blocking().unwrap(), vec![42]);

        assert!(registry.is_bound(&address));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_bind_rejected() {
        let registry = ChannelRegistry::new();
        let address = Address::new("inproc://test/0");
        let (push, pull) = channel(1);

        registry.bind_push(&address, push.clone()).unwrap();
        assert_eq!(
            registry.bind_push(&address, push),
            Err(TransportError::AddressInUse(address.to_string()))
        );
        assert!(registry.bind_pull(&address, pull).is_err());
    }

    #[test]
    fn test_connect_unknown_address() {
        let registry = ChannelRegistry::new();
        let address = Address::new("inproc://missing/0");
        assert_eq!(
            registry.connect_pull(&address).unwrap_err(),
            TransportError::UnknownAddress(address.to_string())
        );
    }
}
