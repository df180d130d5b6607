// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An augmented red-black interval tree keyed by a `(start, size)` range,
//! used to track the free virtual-address ranges of a domain's own
//! address space. Augmentation keeps, at each node, the largest `size`
//! found anywhere in its subtree so a worst-fit search can prune whole
//! subtrees instead of walking every free range.
//!
//! Nodes live in an arena (`Vec<Node>`) addressed by [`NodeId`] rather than
//! behind raw pointers: the tree owns its storage, deletions return slots
//! to a free list, and there is nothing unsafe anywhere in this crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec::Vec;

pub type Addr = usize;
pub type Size = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    start: Addr,
    size: Size,
    max_size: Size,
    color: Color,
}

/// An augmented red-black tree over disjoint `[start, start+size)` ranges.
pub struct RbTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
}

impl Default for RbTree {
    fn default() -> Self { Self::new() }
}

impl RbTree {
    pub fn new() -> Self { RbTree { nodes: Vec::new(), free: Vec::new(), root: None } }

    pub fn is_empty(&self) -> bool { self.root.is_none() }

    /// Slots available for a fresh node without growing the backing
    /// storage: the free list plus any unused `Vec` capacity.
    pub fn free_capacity(&self) -> usize {
        self.free.len() + (self.nodes.capacity() - self.nodes.len())
    }

    /// Reserves capacity for at least `additional` more nodes up front, so
    /// a caller that cannot tolerate an allocator call during a later
    /// `insert`/`delete` (e.g. one driven from a page-fault handler) can
    /// pre-pay for it outside that context.
    pub fn reserve(&mut self, additional: usize) { self.nodes.reserve(additional); }

    pub fn start(&self, id: NodeId) -> Addr { self.node(id).start }
    pub fn size(&self, id: NodeId) -> Size { self.node(id).size }

    fn node(&self, id: NodeId) -> &Node { &self.nodes[id.0] }
    fn node_mut(&mut self, id: NodeId) -> &mut Node { &mut self.nodes[id.0] }

    fn alloc_node(&mut self, start: Addr, size: Size) -> NodeId {
        let n = Node {
            parent: None,
            left: None,
            right: None,
            start,
            size,
            max_size: size,
            color: Color::Red,
        };
        if let Some(id) = self.free.pop() {
            self.nodes[id.0] = n;
            id
        } else {
            self.nodes.push(n);
            NodeId(self.nodes.len() - 1)
        }
    }

    fn color(&self, id: Option<NodeId>) -> Color {
        id.map_or(Color::Black, |id| self.node(id).color)
    }

    fn max_size_of(&self, id: Option<NodeId>) -> Size { id.map_or(0, |id| self.node(id).max_size) }

    fn recompute_max(&mut self, id: NodeId) {
        let n = self.node(id);
        let (left, right, size) = (n.left, n.right, n.size);
        let m = size.max(self.max_size_of(left)).max(self.max_size_of(right));
        self.node_mut(id).max_size = m;
    }

    /// Recomputes `max_size` from `id` up to the root. Used after any
    /// structural change (insert, rotation, delete, `update_size`).
    fn propagate_max(&mut self, mut cur: Option<NodeId>) {
        while let Some(id) = cur {
            self.recompute_max(id);
            cur = self.node(id).parent;
        }
    }

    fn left_rotate(&mut self, x: NodeId) {
        let y = self.node(x).right.expect("left_rotate requires a right child");
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if let Some(yl) = y_left {
            self.node_mut(yl).parent = Some(x);
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.node(p).left == Some(x) {
                    self.node_mut(p).left = Some(y);
                } else {
                    self.node_mut(p).right = Some(y);
                }
            }
        }
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
        self.recompute_max(x);
        self.recompute_max(y);
    }

    fn right_rotate(&mut self, x: NodeId) {
        let y = self.node(x).left.expect("right_rotate requires a left child");
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if let Some(yr) = y_right {
            self.node_mut(yr).parent = Some(x);
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.node(p).left == Some(x) {
                    self.node_mut(p).left = Some(y);
                } else {
                    self.node_mut(p).right = Some(y);
                }
            }
        }
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
        self.recompute_max(x);
        self.recompute_max(y);
    }

    /// Inserts a new disjoint range `[start, start+size)` and returns its id.
    pub fn insert(&mut self, start: Addr, size: Size) -> NodeId {
        let z = self.alloc_node(start, size);
        let mut parent = None;
        let mut cur = self.root;
        while let Some(id) = cur {
            parent = Some(id);
            cur = if start < self.node(id).start { self.node(id).left } else { self.node(id).right };
        }
        self.node_mut(z).parent = parent;
        match parent {
            None => self.root = Some(z),
            Some(p) => {
                if start < self.node(p).start {
                    self.node_mut(p).left = Some(z);
                } else {
                    self.node_mut(p).right = Some(z);
                }
            }
        }
        self.propagate_max(Some(z));
        self.fix_insert(z);
        z
    }

    fn fix_insert(&mut self, mut z: NodeId) {
        while self.color(self.node(z).parent) == Color::Red {
            let parent = self.node(z).parent.unwrap();
            let grandparent = self.node(parent).parent.unwrap(); // red parent implies a grandparent exists
            if Some(parent) == self.node(grandparent).left {
                let uncle = self.node(grandparent).right;
                if self.color(uncle) == Color::Red {
                    self.node_mut(parent).color = Color::Black;
                    self.node_mut(uncle.unwrap()).color = Color::Black;
                    self.node_mut(grandparent).color = Color::Red;
                    z = grandparent;
                } else {
                    if Some(z) == self.node(parent).right {
                        z = parent;
                        self.left_rotate(z);
                    }
                    let parent = self.node(z).parent.unwrap();
                    let grandparent = self.node(parent).parent.unwrap();
                    self.node_mut(parent).color = Color::Black;
                    self.node_mut(grandparent).color = Color::Red;
                    self.right_rotate(grandparent);
                }
            } else {
                let uncle = self.node(grandparent).left;
                if self.color(uncle) == Color::Red {
                    self.node_mut(parent).color = Color::Black;
                    self.node_mut(uncle.unwrap()).color = Color::Black;
                    self.node_mut(grandparent).color = Color::Red;
                    z = grandparent;
                } else {
                    if Some(z) == self.node(parent).left {
                        z = parent;
                        self.right_rotate(z);
                    }
                    let parent = self.node(z).parent.unwrap();
                    let grandparent = self.node(parent).parent.unwrap();
                    self.node_mut(parent).color = Color::Black;
                    self.node_mut(grandparent).color = Color::Red;
                    self.left_rotate(grandparent);
                }
            }
        }
        self.node_mut(self.root.unwrap()).color = Color::Black;
    }

    fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
        let u_parent = self.node(u).parent;
        match u_parent {
            None => self.root = v,
            Some(p) => {
                if self.node(p).left == Some(u) {
                    self.node_mut(p).left = v;
                } else {
                    self.node_mut(p).right = v;
                }
            }
        }
        if let Some(v) = v {
            self.node_mut(v).parent = u_parent;
        }
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.node(id).left {
            id = l;
        }
        id
    }

    /// Removes `id` from the tree. The node's storage slot is recycled.
    pub fn delete(&mut self, z: NodeId) {
        let mut y = z;
        let mut y_original_color = self.node(y).color;
        let x: Option<NodeId>;
        let x_parent: Option<NodeId>;

        if self.node(z).left.is_none() {
            x = self.node(z).right;
            x_parent = self.node(z).parent;
            self.transplant(z, self.node(z).right);
        } else if self.node(z).right.is_none() {
            x = self.node(z).left;
            x_parent = self.node(z).parent;
            self.transplant(z, self.node(z).left);
        } else {
            y = self.minimum(self.node(z).right.unwrap());
            y_original_color = self.node(y).color;
            x = self.node(y).right;
            if self.node(y).parent == Some(z) {
                x_parent = Some(y);
                if let Some(x) = x {
                    self.node_mut(x).parent = Some(y);
                }
            } else {
                x_parent = self.node(y).parent;
                self.transplant(y, self.node(y).right);
                let z_right = self.node(z).right;
                self.node_mut(y).right = z_right;
                if let Some(r) = z_right {
                    self.node_mut(r).parent = Some(y);
                }
            }
            self.transplant(z, Some(y));
            let z_left = self.node(z).left;
            self.node_mut(y).left = z_left;
            if let Some(l) = z_left {
                self.node_mut(l).parent = Some(y);
            }
            self.node_mut(y).color = self.node(z).color;
        }

        self.propagate_max(x_parent);
        if y_original_color == Color::Black {
            self.fix_delete(x, x_parent);
        }

        self.free.push(z);
    }

    fn fix_delete(&mut self, mut x: Option<NodeId>, mut x_parent: Option<NodeId>) {
        while x != self.root && self.color(x) == Color::Black {
            let parent = match x_parent {
                Some(p) => p,
                None => break,
            };
            if self.node(parent).left == x {
                let mut w = self.node(parent).right.unwrap();
                if self.color(Some(w)) == Color::Red {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(parent).color = Color::Red;
                    self.left_rotate(parent);
                    w = self.node(parent).right.unwrap();
                }
                if self.color(self.node(w).left) == Color::Black
                    && self.color(self.node(w).right) == Color::Black
                {
                    self.node_mut(w).color = Color::Red;
                    x = Some(parent);
                    x_parent = self.node(parent).parent;
                } else {
                    if self.color(self.node(w).right) == Color::Black {
                        if let Some(wl) = self.node(w).left {
                            self.node_mut(wl).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.right_rotate(w);
                        w = self.node(parent).right.unwrap();
                    }
                    self.node_mut(w).color = self.node(parent).color;
                    self.node_mut(parent).color = Color::Black;
                    if let Some(wr) = self.node(w).right {
                        self.node_mut(wr).color = Color::Black;
                    }
                    self.left_rotate(parent);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let mut w = self.node(parent).left.unwrap();
                if self.color(Some(w)) == Color::Red {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(parent).color = Color::Red;
                    self.right_rotate(parent);
                    w = self.node(parent).left.unwrap();
                }
                if self.color(self.node(w).right) == Color::Black
                    && self.color(self.node(w).left) == Color::Black
                {
                    self.node_mut(w).color = Color::Red;
                    x = Some(parent);
                    x_parent = self.node(parent).parent;
                } else {
                    if self.color(self.node(w).left) == Color::Black {
                        if let Some(wr) = self.node(w).right {
                            self.node_mut(wr).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.left_rotate(w);
                        w = self.node(parent).left.unwrap();
                    }
                    self.node_mut(w).color = self.node(parent).color;
                    self.node_mut(parent).color = Color::Black;
                    if let Some(wl) = self.node(w).left {
                        self.node_mut(wl).color = Color::Black;
                    }
                    self.right_rotate(parent);
                    x = self.root;
                    x_parent = None;
                }
            }
        }
        if let Some(x) = x {
            self.node_mut(x).color = Color::Black;
        }
    }

    /// Returns the node exactly covering `addr`, i.e. `start <= addr <
    /// start+size`, or `None`.
    pub fn find(&self, addr: Addr) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let n = self.node(id);
            if addr < n.start {
                cur = n.left;
            } else if addr >= n.start + n.size {
                cur = n.right;
            } else {
                return Some(id);
            }
        }
        None
    }

    /// Worst-fit search: returns a node whose `size >= size`, descending
    /// toward the smallest child whose subtree-max still accommodates
    /// `size`, using the augmented `max_size` field to prune subtrees that
    /// cannot satisfy the request at all.
    pub fn find_minsize(&self, size: Size) -> Option<NodeId> {
        self.find_minsize_from(self.root, size)
    }

    fn find_minsize_from(&self, cur: Option<NodeId>, size: Size) -> Option<NodeId> {
        let id = cur?;
        let n = self.node(id);
        if n.max_size < size {
            return None;
        }

        // Among this node itself, its left subtree, and its right subtree
        // (whichever can satisfy the request), pick the smallest qualifying
        // candidate so the chosen block is as small as possible while still
        // fitting -- then recurse into that subtree, or stop if the node
        // itself won.
        let mut candidate = id;
        let mut best_size = if n.size >= size { n.size } else { usize::MAX };

        let left_max = self.max_size_of(n.left);
        if let Some(left) = n.left {
            if left_max >= size && left_max < best_size {
                candidate = left;
                best_size = left_max;
            }
        }

        let right_max = self.max_size_of(n.right);
        if let Some(right) = n.right {
            if right_max >= size && right_max < best_size {
                candidate = right;
                best_size = right_max;
            }
        }

        if candidate == id {
            Some(id)
        } else {
            self.find_minsize_from(Some(candidate), size)
        }
    }

    /// Returns the first node whose `start >= addr`, or `None`.
    pub fn find_greater(&self, addr: Addr) -> Option<NodeId> {
        let mut cur = self.root;
        let mut best = None;
        while let Some(id) = cur {
            let n = self.node(id);
            if n.start >= addr {
                best = Some(id);
                cur = n.left;
            } else {
                cur = n.right;
            }
        }
        best
    }

    /// Returns the last node whose `start <= addr`, or `None`.
    pub fn find_lower(&self, addr: Addr) -> Option<NodeId> {
        let mut cur = self.root;
        let mut best = None;
        while let Some(id) = cur {
            let n = self.node(id);
            if n.start <= addr {
                best = Some(id);
                cur = n.right;
            } else {
                cur = n.left;
            }
        }
        best
    }

    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(r) = self.node(id).right {
            return Some(self.minimum(r));
        }
        let mut cur = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(cur) {
                return Some(p);
            }
            cur = p;
            parent = self.node(p).parent;
        }
        None
    }

    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(l) = self.node(id).left {
            let mut cur = l;
            while let Some(r) = self.node(cur).right {
                cur = r;
            }
            return Some(cur);
        }
        let mut cur = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(cur) {
                return Some(p);
            }
            cur = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// Updates `id`'s size in place without disturbing tree position
    /// (the range's `start` -- and hence ordering -- is unchanged).
    pub fn update_size(&mut self, id: NodeId, size: Size) {
        self.node_mut(id).size = size;
        self.propagate_max(Some(id));
    }

    /// Validates red-black and BST-ordering invariants; intended for tests
    /// and debug assertions, not the steady-state hot path.
    pub fn check(&self) -> bool {
        if self.color(self.root) != Color::Black {
            return false;
        }
        self.check_node(self.root, Addr::MIN, Addr::MAX).is_some()
    }

    /// Returns `Some(black_height)` if the subtree rooted at `cur` is a
    /// valid augmented red-black BST within `(lo, hi)`, else `None`.
    fn check_node(&self, cur: Option<NodeId>, lo: Addr, hi: Addr) -> Option<usize> {
        let id = match cur {
            None => return Some(1), // nil nodes count as black
            Some(id) => id,
        };
        let n = self.node(id);
        if n.start < lo || n.start > hi {
            return None;
        }
        if n.color == Color::Red {
            if self.color(n.left) == Color::Red || self.color(n.right) == Color::Red {
                return None;
            }
        }
        let expect_max = n.size.max(self.max_size_of(n.left)).max(self.max_size_of(n.right));
        if n.max_size != expect_max {
            return None;
        }
        let left_bh = self.check_node(n.left, lo, n.start.wrapping_sub(1).min(n.start))?;
        let right_bh = self.check_node(n.right, n.start.wrapping_add(1).max(n.start), hi)?;
        if left_bh != right_bh {
            return None;
        }
        Some(left_bh + if n.color == Color::Black { 1 } else { 0 })
    }
}
