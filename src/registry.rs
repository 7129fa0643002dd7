//! Connection registry.
//!
//! Owns every live connection control block, keyed by descriptor. A block
//! removed from the registry is owned by whoever removed it, which is how a
//! block ends up closed at most once.

use crate::connection::ConnectionBlock;
use crate::error::Error;
use std::collections::HashMap;
use std::os::fd::RawFd;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    blocks: HashMap<RawFd, ConnectionBlock>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `block`. A second block for the same descriptor is
    /// an invariant violation; the refused block is dropped.
    pub fn insert(&mut self, block: ConnectionBlock) -> Result<(), Error> {
        let fd = block.fd();
        if self.blocks.contains_key(&fd) {
            return Err(Error::DuplicateDescriptor { fd });
        }
        self.blocks.insert(fd, block);
        Ok(())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut ConnectionBlock> {
        self.blocks.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<ConnectionBlock> {
        self.blocks.remove(&fd)
    }

    /// Live descriptors in ascending order.
    pub fn descriptors(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.blocks.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionBlock> {
        self.blocks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SecurityMode;
    use mio::net::TcpListener;

    fn listening_block() -> ConnectionBlock {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        ConnectionBlock::listening(listener, SecurityMode::Plain).unwrap()
    }

    #[test]
    fn blocks_are_found_by_exact_descriptor() {
        let mut registry = Registry::new();
        let a = listening_block();
        let b = listening_block();
        let (fd_a, fd_b) = (a.fd(), b.fd());
        registry.insert(a).unwrap();
        registry.insert(b).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(fd_a).map(|block| block.fd()), Some(fd_a));
        let mut expected = vec![fd_a, fd_b];
        expected.sort_unstable();
        assert_eq!(registry.descriptors(), expected);
    }

    #[test]
    fn removed_blocks_are_gone() {
        let mut registry = Registry::new();
        let block = listening_block();
        let fd = block.fd();
        registry.insert(block).unwrap();

        assert!(registry.remove(fd).is_some());
        assert!(registry.remove(fd).is_none());
        assert!(registry.get_mut(fd).is_none());
        assert_eq!(registry.len(), 0);
    }
}
