//! The persistent copy-on-write AVL engine.
//!
//! Nodes live in the arena and are addressed by offset; a tree is
//! identified by the offset of its root node, with 0 meaning empty. A
//! mutation never rewrites an existing node's bytes: it allocates new
//! versions of the changed path and shares every other subtree by offset,
//! so an old root remains a valid, immutable view of the prior state.

use std::cmp::Ordering;
use std::marker::PhantomData;

use tarmac_arena::Arena;
use tarmac_error::Result;
use tarmac_types::encoding::{get_u32, get_u64, put_u32, put_u64};
use tarmac_types::OffT;

use crate::traits::{TreeAnnotation, TreePayload};

/// On-disk node header: left offset, right offset, height.
const NODE_HEADER: usize = 20;

/// A materialized tree node.
#[derive(Debug, Clone)]
pub struct Node<P, A> {
    pub left: OffT,
    pub right: OffT,
    pub height: u32,
    pub payload: P,
    pub annotation: A,
}

/// One step of an annotation-directed descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descent {
    Left,
    Here,
    Right,
}

/// Result of an insert: the new root, the offset of the inserted or
/// replacing node, and whether an equal-keyed payload was replaced.
#[derive(Debug, Clone, Copy)]
pub struct InsertOutcome {
    pub root: OffT,
    pub node: OffT,
    pub replaced: bool,
}

struct InsertInfo {
    node: OffT,
    replaced: bool,
}

/// A disk-resident AVL tree over payload `P` with subtree annotation `A`.
///
/// The type itself is stateless; every operation takes the arena and a
/// root offset, and mutations return the new root.
pub struct AvlDisk<P, A> {
    _marker: PhantomData<(P, A)>,
}

impl<P: TreePayload, A: TreeAnnotation<P>> AvlDisk<P, A> {
    /// Total encoded size of one node.
    pub const NODE_SIZE: usize = NODE_HEADER + P::SIZE + A::SIZE;

    /// Byte offset of the annotation field within a node record.
    const ANN_OFF: usize = NODE_HEADER + P::SIZE;

    /// Read the node stored at `off`.
    pub fn read_node(arena: &Arena, off: OffT) -> Result<Node<P, A>> {
        let buf = arena.read_bytes(off, Self::NODE_SIZE)?;
        Ok(Node {
            left: get_u64(&buf, 0),
            right: get_u64(&buf, 8),
            height: get_u32(&buf, 16),
            payload: P::read_from(&buf[NODE_HEADER..NODE_HEADER + P::SIZE]),
            annotation: A::read_from(&buf[Self::ANN_OFF..]),
        })
    }

    /// Height of the subtree rooted at `off` (0 for the empty tree).
    fn subtree_height(arena: &Arena, off: OffT) -> Result<u32> {
        if off == 0 {
            return Ok(0);
        }
        let buf = arena.read_bytes(off + 16, 4)?;
        Ok(get_u32(&buf, 0))
    }

    /// Annotation of the subtree rooted at `off` (default for empty).
    pub fn subtree_annotation(arena: &Arena, off: OffT) -> Result<A> {
        if off == 0 {
            return Ok(A::default());
        }
        let buf = arena.read_bytes(off + Self::ANN_OFF as u64, A::SIZE)?;
        Ok(A::read_from(&buf))
    }

    /// Allocate and write a fresh node, deriving height and annotation from
    /// its children.
    fn make_node(arena: &mut Arena, left: OffT, right: OffT, payload: P) -> Result<OffT> {
        let lh = Self::subtree_height(arena, left)?;
        let rh = Self::subtree_height(arena, right)?;
        let la = Self::subtree_annotation(arena, left)?;
        let ra = Self::subtree_annotation(arena, right)?;
        let node = Node {
            left,
            right,
            height: 1 + lh.max(rh),
            annotation: la.combine(&A::lift(&payload)).combine(&ra),
            payload,
        };
        let mut buf = vec![0_u8; Self::NODE_SIZE];
        put_u64(&mut buf, 0, node.left);
        put_u64(&mut buf, 8, node.right);
        put_u32(&mut buf, 16, node.height);
        node.payload.write_to(&mut buf[NODE_HEADER..Self::ANN_OFF]);
        node.annotation.write_to(&mut buf[Self::ANN_OFF..]);
        let off = arena.alloc(Self::NODE_SIZE as u64)?;
        arena.write_bytes(off, &buf)?;
        Ok(off)
    }

    /// Build a node over `left`/`right`, rotating if their heights differ
    /// by two. Children may be out of balance by at most one rotation's
    /// worth, which is all insert and remove ever produce.
    fn build_balanced(arena: &mut Arena, left: OffT, right: OffT, payload: P) -> Result<OffT> {
        let lh = Self::subtree_height(arena, left)?;
        let rh = Self::subtree_height(arena, right)?;
        if lh > rh + 1 {
            let l = Self::read_node(arena, left)?;
            let llh = Self::subtree_height(arena, l.left)?;
            let lrh = Self::subtree_height(arena, l.right)?;
            if llh >= lrh {
                let new_right = Self::make_node(arena, l.right, right, payload)?;
                Self::make_node(arena, l.left, new_right, l.payload)
            } else {
                let lr = Self::read_node(arena, l.right)?;
                let new_left = Self::make_node(arena, l.left, lr.left, l.payload)?;
                let new_right = Self::make_node(arena, lr.right, right, payload)?;
                Self::make_node(arena, new_left, new_right, lr.payload)
            }
        } else if rh > lh + 1 {
            let r = Self::read_node(arena, right)?;
            let rlh = Self::subtree_height(arena, r.left)?;
            let rrh = Self::subtree_height(arena, r.right)?;
            if rrh >= rlh {
                let new_left = Self::make_node(arena, left, r.left, payload)?;
                Self::make_node(arena, new_left, r.right, r.payload)
            } else {
                let rl = Self::read_node(arena, r.left)?;
                let new_left = Self::make_node(arena, left, rl.left, payload)?;
                let new_right = Self::make_node(arena, rl.right, r.right, r.payload)?;
                Self::make_node(arena, new_left, new_right, rl.payload)
            }
        } else {
            Self::make_node(arena, left, right, payload)
        }
    }

    /// Insert `payload`, or replace the payload of an equal-keyed node.
    ///
    /// Replacement is copy-on-write and causes no structural change.
    pub fn insert(arena: &mut Arena, root: OffT, payload: P) -> Result<InsertOutcome> {
        let mut info = InsertInfo {
            node: 0,
            replaced: false,
        };
        let new_root = Self::insert_rec(arena, root, payload, &mut info)?;
        Ok(InsertOutcome {
            root: new_root,
            node: info.node,
            replaced: info.replaced,
        })
    }

    fn insert_rec(arena: &mut Arena, off: OffT, payload: P, info: &mut InsertInfo) -> Result<OffT> {
        if off == 0 {
            let node = Self::make_node(arena, 0, 0, payload)?;
            info.node = node;
            return Ok(node);
        }
        let node = Self::read_node(arena, off)?;
        match payload.cmp_payload(&node.payload) {
            Ordering::Equal => {
                let replacement = Self::make_node(arena, node.left, node.right, payload)?;
                info.node = replacement;
                info.replaced = true;
                Ok(replacement)
            }
            Ordering::Less => {
                let new_left = Self::insert_rec(arena, node.left, payload, info)?;
                Self::build_balanced(arena, new_left, node.right, node.payload)
            }
            Ordering::Greater => {
                let new_right = Self::insert_rec(arena, node.right, payload, info)?;
                Self::build_balanced(arena, node.left, new_right, node.payload)
            }
        }
    }

    /// Remove the node comparing equal to `probe`, if any, returning the
    /// new root and the removed payload.
    pub fn remove(arena: &mut Arena, root: OffT, probe: &P) -> Result<Option<(OffT, P)>> {
        let mut removed = None;
        let new_root = Self::remove_rec(arena, root, probe, &mut removed)?;
        Ok(removed.map(|payload| (new_root, payload)))
    }

    fn remove_rec(
        arena: &mut Arena,
        off: OffT,
        probe: &P,
        removed: &mut Option<P>,
    ) -> Result<OffT> {
        if off == 0 {
            return Ok(0);
        }
        let node = Self::read_node(arena, off)?;
        match probe.cmp_payload(&node.payload) {
            Ordering::Less => {
                let new_left = Self::remove_rec(arena, node.left, probe, removed)?;
                if removed.is_none() {
                    return Ok(off);
                }
                Self::build_balanced(arena, new_left, node.right, node.payload)
            }
            Ordering::Greater => {
                let new_right = Self::remove_rec(arena, node.right, probe, removed)?;
                if removed.is_none() {
                    return Ok(off);
                }
                Self::build_balanced(arena, node.left, new_right, node.payload)
            }
            Ordering::Equal => {
                *removed = Some(node.payload);
                if node.left == 0 {
                    return Ok(node.right);
                }
                if node.right == 0 {
                    return Ok(node.left);
                }
                let (new_right, successor) = Self::remove_leftmost(arena, node.right)?;
                Self::build_balanced(arena, node.left, new_right, successor)
            }
        }
    }

    /// Detach the leftmost payload of the subtree at `off`, returning the
    /// rebuilt subtree and the detached payload.
    fn remove_leftmost(arena: &mut Arena, off: OffT) -> Result<(OffT, P)> {
        let node = Self::read_node(arena, off)?;
        if node.left == 0 {
            return Ok((node.right, node.payload));
        }
        let (new_left, detached) = Self::remove_leftmost(arena, node.left)?;
        let rebuilt = Self::build_balanced(arena, new_left, node.right, node.payload)?;
        Ok((rebuilt, detached))
    }

    /// Find the node comparing equal to `probe`.
    pub fn search(arena: &Arena, root: OffT, probe: &P) -> Result<Option<(OffT, P)>> {
        Self::search_by(arena, root, |payload| probe.cmp_payload(payload))
    }

    /// Ordered descent directed by `target_cmp`, which reports where the
    /// target sorts relative to a visited payload.
    pub fn search_by(
        arena: &Arena,
        root: OffT,
        target_cmp: impl Fn(&P) -> Ordering,
    ) -> Result<Option<(OffT, P)>> {
        let mut off = root;
        while off != 0 {
            let node = Self::read_node(arena, off)?;
            match target_cmp(&node.payload) {
                Ordering::Less => off = node.left,
                Ordering::Greater => off = node.right,
                Ordering::Equal => return Ok(Some((off, node.payload))),
            }
        }
        Ok(None)
    }

    /// Descend directed by subtree annotations instead of the key order.
    ///
    /// At every node, `choose` sees the node and the annotations of its
    /// children (defaults for empty children) and picks a direction; this
    /// is how "the Nth element satisfying a constraint" searches run in a
    /// single log-time pass.
    pub fn find_by_annotation(
        arena: &Arena,
        root: OffT,
        mut choose: impl FnMut(&Node<P, A>, &A, &A) -> Descent,
    ) -> Result<Option<(OffT, P)>> {
        let mut off = root;
        while off != 0 {
            let node = Self::read_node(arena, off)?;
            let left_ann = Self::subtree_annotation(arena, node.left)?;
            let right_ann = Self::subtree_annotation(arena, node.right)?;
            match choose(&node, &left_ann, &right_ann) {
                Descent::Left => off = node.left,
                Descent::Here => return Ok(Some((off, node.payload))),
                Descent::Right => off = node.right,
            }
        }
        Ok(None)
    }

    /// First payload in tree order.
    pub fn leftmost(arena: &Arena, root: OffT) -> Result<Option<(OffT, P)>> {
        let mut off = root;
        let mut found = None;
        while off != 0 {
            let node = Self::read_node(arena, off)?;
            found = Some((off, node.payload));
            off = node.left;
        }
        Ok(found)
    }

    /// Last payload in tree order.
    pub fn rightmost(arena: &Arena, root: OffT) -> Result<Option<(OffT, P)>> {
        let mut off = root;
        let mut found = None;
        while off != 0 {
            let node = Self::read_node(arena, off)?;
            found = Some((off, node.payload));
            off = node.right;
        }
        Ok(found)
    }

    /// In-order successor: the smallest payload comparing greater than
    /// `cur`.
    pub fn next(arena: &Arena, root: OffT, cur: &P) -> Result<Option<(OffT, P)>> {
        let mut off = root;
        let mut best = None;
        while off != 0 {
            let node = Self::read_node(arena, off)?;
            if cur.cmp_payload(&node.payload) == Ordering::Less {
                best = Some((off, node.payload));
                off = node.left;
            } else {
                off = node.right;
            }
        }
        Ok(best)
    }

    /// In-order predecessor: the largest payload comparing less than
    /// `cur`.
    pub fn prev(arena: &Arena, root: OffT, cur: &P) -> Result<Option<(OffT, P)>> {
        let mut off = root;
        let mut best = None;
        while off != 0 {
            let node = Self::read_node(arena, off)?;
            if cur.cmp_payload(&node.payload) == Ordering::Greater {
                best = Some((off, node.payload));
                off = node.right;
            } else {
                off = node.left;
            }
        }
        Ok(best)
    }

    /// In-order traversal of the whole tree.
    pub fn walk<F>(arena: &Arena, root: OffT, visit: &mut F) -> Result<()>
    where
        F: FnMut(OffT, &P) -> Result<()>,
    {
        if root == 0 {
            return Ok(());
        }
        let node = Self::read_node(arena, root)?;
        Self::walk(arena, node.left, visit)?;
        visit(root, &node.payload)?;
        Self::walk(arena, node.right, visit)
    }

    /// Overwrite the annotation slot of the node at `node_off`.
    ///
    /// This is the one sanctioned in-place write against an exposed node:
    /// the layered-range post-pass fills annotation slots that were
    /// reserved (zeroed) at insert time, exactly once per node.
    pub fn write_annotation(arena: &mut Arena, node_off: OffT, annotation: &A) -> Result<()> {
        let mut buf = vec![0_u8; A::SIZE];
        annotation.write_to(&mut buf);
        arena.write_bytes(node_off + Self::ANN_OFF as u64, &buf)
    }
}
