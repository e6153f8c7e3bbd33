//! Synchronisation and inventory payloads.

use serde::{Deserialize, Serialize};
use umbra_types::Hash;

/// Kind of an inventory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

/// A single inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash,
}

/// Inventory announcement, also the reply to [`GetBlocks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Inv {
    pub items: Vec<InvItem>,
}

impl Inv {
    pub fn add_block(&mut self, hash: Hash) {
        self.items.push(InvItem {
            kind: InvKind::Block,
            hash,
        });
    }

    pub fn add_tx(&mut self, hash: Hash) {
        self.items.push(InvItem {
            kind: InvKind::Tx,
            hash,
        });
    }
}

/// Request for the block range `(from, to]` sent when the synchroniser
/// detects the node is behind. `locator` is the requester's tip hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocks {
    pub locator: Hash,
    pub from: u64,
    pub to: u64,
}

/// Request for the data behind inventory items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetData {
    pub items: Vec<InvItem>,
}

/// Peer address advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_round_trip() {
        let mut inv = Inv::default();
        inv.add_block(Hash::digest(b"blk"));
        inv.add_tx(Hash::digest(b"tx"));

        let bytes = bincode::serialize(&inv).unwrap();
        let back: Inv = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, inv);
    }
}
