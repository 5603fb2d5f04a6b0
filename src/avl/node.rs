use serde::{Deserialize, Serialize};

use crate::crypto::hash_parts;
use crate::types::BoxId;

/// Content hash naming a node.
pub type Label = [u8; 32];

const LEAF_DOMAIN: &[u8] = b"cinder.avl.leaf";
const INTERNAL_DOMAIN: &[u8] = b"cinder.avl.node";

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        key: BoxId,
        value: Vec<u8>,
    },
    Internal {
        /// Largest key reachable through the left child; lookups for keys at
        /// or below it descend left.
        split: BoxId,
        height: u8,
        left: Label,
        right: Label,
    },
}

impl Node {
    pub fn height(&self) -> u8 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { height, .. } => *height,
        }
    }

    pub fn label(&self) -> Label {
        match self {
            Node::Leaf { key, value } => {
                hash_parts(&[LEAF_DOMAIN, &key.to_bytes(), value])
            }
            Node::Internal {
                split,
                height,
                left,
                right,
            } => hash_parts(&[
                INTERNAL_DOMAIN,
                &[*height],
                &split.to_bytes(),
                left,
                right,
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: u8) -> BoxId {
        BoxId {
            tag,
            hash: [tag; 32],
        }
    }

    #[test]
    fn labels_are_content_addressed() {
        let a = Node::Leaf {
            key: key(1),
            value: vec![1, 2, 3],
        };
        let b = Node::Leaf {
            key: key(1),
            value: vec![1, 2, 3],
        };
        assert_eq!(a.label(), b.label());

        let c = Node::Leaf {
            key: key(1),
            value: vec![1, 2, 4],
        };
        assert_ne!(a.label(), c.label());
    }

    #[test]
    fn leaf_and_internal_labels_do_not_collide() {
        let leaf = Node::Leaf {
            key: key(1),
            value: Vec::new(),
        };
        let internal = Node::Internal {
            split: key(1),
            height: 1,
            left: [0u8; 32],
            right: [0u8; 32],
        };
        assert_ne!(leaf.label(), internal.label());
    }
}
