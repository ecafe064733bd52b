//! Intrusive red-black tree.  Elements embed one `RbNode` per tree they
//! can appear in; an order type picks the embedded node and the key
//! comparison, so one element type can participate in several trees
//! (extent nodes are keyed by size in the recycle tree and by address in
//! the coalesce tree).
//!
//! Everything here works on raw element pointers: the elements live in
//! base-allocated metadata or chunk headers, never in Rust-owned
//! containers, and the caller is responsible for their lifetime.
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ptr;

/// Tree linkage embedded in an element.  The zeroed state is a valid
/// "not in a tree" state, which matters because most elements live in
/// zero-initialised base allocations.
pub struct RbNode<T> {
    left: *mut T,
    right: *mut T,
    parent: *mut T,
    red: bool,
}

impl<T> RbNode<T> {
    pub const fn new() -> RbNode<T> {
        RbNode {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            red: false,
        }
    }
}

impl<T> Default for RbNode<T> {
    fn default() -> Self {
        RbNode::new()
    }
}

/// How a tree finds its linkage within an element and orders elements.
/// `cmp`'s first argument may be a synthetic key that is never inserted;
/// all inserted elements must be pairwise distinct under the order.
pub trait RbOrder<T> {
    /// # Safety
    ///
    /// `t` must point to a live element.
    unsafe fn node(t: *mut T) -> *mut RbNode<T>;

    /// # Safety
    ///
    /// Both pointers must be valid for reads of the key fields.
    unsafe fn cmp(a: *const T, b: *const T) -> Ordering;
}

pub struct RbTree<T, O: RbOrder<T>> {
    root: *mut T,
    _order: PhantomData<fn() -> O>,
}

// Methods below are all `unsafe fn`: they dereference caller-supplied
// element pointers.  The invariant the caller maintains is that every
// element reachable from `root` is live and its linkage is only mutated
// through this tree.
impl<T, O: RbOrder<T>> RbTree<T, O> {
    pub const fn new() -> Self {
        RbTree {
            root: ptr::null_mut(),
            _order: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    unsafe fn left(x: *mut T) -> *mut T {
        (*O::node(x)).left
    }

    unsafe fn right(x: *mut T) -> *mut T {
        (*O::node(x)).right
    }

    unsafe fn parent(x: *mut T) -> *mut T {
        (*O::node(x)).parent
    }

    unsafe fn is_red(x: *mut T) -> bool {
        !x.is_null() && (*O::node(x)).red
    }

    unsafe fn set_left(x: *mut T, v: *mut T) {
        (*O::node(x)).left = v;
    }

    unsafe fn set_right(x: *mut T, v: *mut T) {
        (*O::node(x)).right = v;
    }

    unsafe fn set_parent(x: *mut T, v: *mut T) {
        (*O::node(x)).parent = v;
    }

    unsafe fn set_red(x: *mut T, red: bool) {
        (*O::node(x)).red = red;
    }

    unsafe fn rotate_left(&mut self, x: *mut T) {
        let y = Self::right(x);
        debug_assert!(!y.is_null());
        Self::set_right(x, Self::left(y));
        if !Self::left(y).is_null() {
            Self::set_parent(Self::left(y), x);
        }
        Self::set_parent(y, Self::parent(x));
        if Self::parent(x).is_null() {
            self.root = y;
        } else if x == Self::left(Self::parent(x)) {
            Self::set_left(Self::parent(x), y);
        } else {
            Self::set_right(Self::parent(x), y);
        }
        Self::set_left(y, x);
        Self::set_parent(x, y);
    }

    unsafe fn rotate_right(&mut self, x: *mut T) {
        let y = Self::left(x);
        debug_assert!(!y.is_null());
        Self::set_left(x, Self::right(y));
        if !Self::right(y).is_null() {
            Self::set_parent(Self::right(y), x);
        }
        Self::set_parent(y, Self::parent(x));
        if Self::parent(x).is_null() {
            self.root = y;
        } else if x == Self::right(Self::parent(x)) {
            Self::set_right(Self::parent(x), y);
        } else {
            Self::set_left(Self::parent(x), y);
        }
        Self::set_right(y, x);
        Self::set_parent(x, y);
    }

    /// Inserts `elm`, which must not already be in the tree.
    pub unsafe fn insert(&mut self, elm: *mut T) {
        let mut y: *mut T = ptr::null_mut();
        let mut x = self.root;
        while !x.is_null() {
            y = x;
            x = if O::cmp(elm, x) == Ordering::Less {
                Self::left(x)
            } else {
                Self::right(x)
            };
        }
        Self::set_parent(elm, y);
        if y.is_null() {
            self.root = elm;
        } else if O::cmp(elm, y) == Ordering::Less {
            Self::set_left(y, elm);
        } else {
            Self::set_right(y, elm);
        }
        Self::set_left(elm, ptr::null_mut());
        Self::set_right(elm, ptr::null_mut());
        Self::set_red(elm, true);
        self.insert_fixup(elm);
    }

    unsafe fn insert_fixup(&mut self, mut z: *mut T) {
        while Self::is_red(Self::parent(z)) {
            let p = Self::parent(z);
            // A red parent is never the root, so the grandparent exists.
            let g = Self::parent(p);
            if p == Self::left(g) {
                let u = Self::right(g);
                if Self::is_red(u) {
                    Self::set_red(p, false);
                    Self::set_red(u, false);
                    Self::set_red(g, true);
                    z = g;
                } else {
                    if z == Self::right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = Self::parent(z);
                    let g = Self::parent(p);
                    Self::set_red(p, false);
                    Self::set_red(g, true);
                    self.rotate_right(g);
                }
            } else {
                let u = Self::left(g);
                if Self::is_red(u) {
                    Self::set_red(p, false);
                    Self::set_red(u, false);
                    Self::set_red(g, true);
                    z = g;
                } else {
                    if z == Self::left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = Self::parent(z);
                    let g = Self::parent(p);
                    Self::set_red(p, false);
                    Self::set_red(g, true);
                    self.rotate_left(g);
                }
            }
        }
        Self::set_red(self.root, false);
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v`
    /// (`v` may be null).
    unsafe fn transplant(&mut self, u: *mut T, v: *mut T) {
        let up = Self::parent(u);
        if up.is_null() {
            self.root = v;
        } else if u == Self::left(up) {
            Self::set_left(up, v);
        } else {
            Self::set_right(up, v);
        }
        if !v.is_null() {
            Self::set_parent(v, up);
        }
    }

    unsafe fn minimum(mut x: *mut T) -> *mut T {
        while !Self::left(x).is_null() {
            x = Self::left(x);
        }
        x
    }

    unsafe fn maximum(mut x: *mut T) -> *mut T {
        while !Self::right(x).is_null() {
            x = Self::right(x);
        }
        x
    }

    /// Removes `elm`, which must be in the tree.
    pub unsafe fn remove(&mut self, elm: *mut T) {
        let z = elm;
        let mut y = z;
        let mut y_was_red = Self::is_red(y);
        let x: *mut T;
        let mut x_parent: *mut T;

        if Self::left(z).is_null() {
            x = Self::right(z);
            x_parent = Self::parent(z);
            self.transplant(z, x);
        } else if Self::right(z).is_null() {
            x = Self::left(z);
            x_parent = Self::parent(z);
            self.transplant(z, x);
        } else {
            y = Self::minimum(Self::right(z));
            y_was_red = Self::is_red(y);
            x = Self::right(y);
            if Self::parent(y) == z {
                x_parent = y;
            } else {
                x_parent = Self::parent(y);
                self.transplant(y, x);
                Self::set_right(y, Self::right(z));
                Self::set_parent(Self::right(y), y);
            }
            self.transplant(z, y);
            Self::set_left(y, Self::left(z));
            Self::set_parent(Self::left(y), y);
            Self::set_red(y, Self::is_red(z));
        }

        if !y_was_red {
            self.remove_fixup(x, x_parent);
        }

        // Clear the removed element's linkage; elements routinely get
        // reinserted and some callers test membership by null links.
        let node = O::node(z);
        (*node).left = ptr::null_mut();
        (*node).right = ptr::null_mut();
        (*node).parent = ptr::null_mut();
        (*node).red = false;
    }

    unsafe fn remove_fixup(&mut self, mut x: *mut T, mut x_parent: *mut T) {
        while x != self.root && !Self::is_red(x) {
            if x_parent.is_null() {
                break;
            }
            if x == Self::left(x_parent) {
                let mut w = Self::right(x_parent);
                if Self::is_red(w) {
                    Self::set_red(w, false);
                    Self::set_red(x_parent, true);
                    self.rotate_left(x_parent);
                    w = Self::right(x_parent);
                }
                if !Self::is_red(Self::left(w)) && !Self::is_red(Self::right(w)) {
                    Self::set_red(w, true);
                    x = x_parent;
                    x_parent = Self::parent(x);
                } else {
                    if !Self::is_red(Self::right(w)) {
                        if !Self::left(w).is_null() {
                            Self::set_red(Self::left(w), false);
                        }
                        Self::set_red(w, true);
                        self.rotate_right(w);
                        w = Self::right(x_parent);
                    }
                    Self::set_red(w, Self::is_red(x_parent));
                    Self::set_red(x_parent, false);
                    if !Self::right(w).is_null() {
                        Self::set_red(Self::right(w), false);
                    }
                    self.rotate_left(x_parent);
                    x = self.root;
                    x_parent = ptr::null_mut();
                }
            } else {
                let mut w = Self::left(x_parent);
                if Self::is_red(w) {
                    Self::set_red(w, false);
                    Self::set_red(x_parent, true);
                    self.rotate_right(x_parent);
                    w = Self::left(x_parent);
                }
                if !Self::is_red(Self::left(w)) && !Self::is_red(Self::right(w)) {
                    Self::set_red(w, true);
                    x = x_parent;
                    x_parent = Self::parent(x);
                } else {
                    if !Self::is_red(Self::left(w)) {
                        if !Self::right(w).is_null() {
                            Self::set_red(Self::right(w), false);
                        }
                        Self::set_red(w, true);
                        self.rotate_left(w);
                        w = Self::left(x_parent);
                    }
                    Self::set_red(w, Self::is_red(x_parent));
                    Self::set_red(x_parent, false);
                    if !Self::left(w).is_null() {
                        Self::set_red(Self::left(w), false);
                    }
                    self.rotate_right(x_parent);
                    x = self.root;
                    x_parent = ptr::null_mut();
                }
            }
        }
        if !x.is_null() {
            Self::set_red(x, false);
        }
    }

    /// Returns the element equal to `key`, or null.
    pub unsafe fn search(&self, key: *const T) -> *mut T {
        let mut x = self.root;
        while !x.is_null() {
            match O::cmp(key, x) {
                Ordering::Less => x = Self::left(x),
                Ordering::Greater => x = Self::right(x),
                Ordering::Equal => return x,
            }
        }
        ptr::null_mut()
    }

    /// As `search`, but under a different order sharing the same
    /// embedded node, e.g. a bounds order that matches any element whose
    /// span contains the key.
    pub unsafe fn search_with<O2: RbOrder<T>>(&self, key: *const T) -> *mut T {
        let mut x = self.root;
        while !x.is_null() {
            match O2::cmp(key, x) {
                Ordering::Less => x = Self::left(x),
                Ordering::Greater => x = Self::right(x),
                Ordering::Equal => return x,
            }
        }
        ptr::null_mut()
    }

    /// Returns the element equal to `key`, or the least element greater
    /// than it, or null.  This is the best-fit / coalesce primitive.
    pub unsafe fn search_or_next(&self, key: *const T) -> *mut T {
        let mut result = ptr::null_mut();
        let mut x = self.root;
        while !x.is_null() {
            match O::cmp(key, x) {
                Ordering::Less => {
                    result = x;
                    x = Self::left(x);
                }
                Ordering::Greater => x = Self::right(x),
                Ordering::Equal => return x,
            }
        }
        result
    }

    pub unsafe fn first(&self) -> *mut T {
        if self.root.is_null() {
            ptr::null_mut()
        } else {
            Self::minimum(self.root)
        }
    }

    pub unsafe fn last(&self) -> *mut T {
        if self.root.is_null() {
            ptr::null_mut()
        } else {
            Self::maximum(self.root)
        }
    }

    /// In-order successor of an element in the tree.
    pub unsafe fn next(&self, elm: *mut T) -> *mut T {
        if !Self::right(elm).is_null() {
            return Self::minimum(Self::right(elm));
        }
        let mut x = elm;
        let mut p = Self::parent(x);
        while !p.is_null() && x == Self::right(p) {
            x = p;
            p = Self::parent(x);
        }
        p
    }

    /// In-order predecessor of an element in the tree.
    pub unsafe fn prev(&self, elm: *mut T) -> *mut T {
        if !Self::left(elm).is_null() {
            return Self::maximum(Self::left(elm));
        }
        let mut x = elm;
        let mut p = Self::parent(x);
        while !p.is_null() && x == Self::left(p) {
            x = p;
            p = Self::parent(x);
        }
        p
    }

    /// In-order iteration.  The tree must not be mutated while the
    /// iterator is alive.
    pub unsafe fn iter(&self) -> RbIter<'_, T, O> {
        RbIter {
            tree: self,
            current: self.first(),
        }
    }
}

pub struct RbIter<'a, T, O: RbOrder<T>> {
    tree: &'a RbTree<T, O>,
    current: *mut T,
}

impl<'a, T, O: RbOrder<T>> Iterator for RbIter<'a, T, O> {
    type Item = *mut T;

    fn next(&mut self) -> Option<*mut T> {
        if self.current.is_null() {
            return None;
        }
        let ret = self.current;
        self.current = unsafe { self.tree.next(ret) };
        Some(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    struct TestElem {
        key: u64,
        link: RbNode<TestElem>,
    }

    struct ByKey;

    impl RbOrder<TestElem> for ByKey {
        unsafe fn node(t: *mut TestElem) -> *mut RbNode<TestElem> {
            ptr::addr_of_mut!((*t).link)
        }

        unsafe fn cmp(a: *const TestElem, b: *const TestElem) -> Ordering {
            (*a).key.cmp(&(*b).key)
        }
    }

    fn make(key: u64) -> *mut TestElem {
        Box::into_raw(Box::new(TestElem {
            key,
            link: RbNode::new(),
        }))
    }

    unsafe fn free(elm: *mut TestElem) {
        drop(Box::from_raw(elm));
    }

    // Checks the red-black invariants below `x` and returns its black
    // height.
    unsafe fn check_subtree(x: *mut TestElem) -> usize {
        if x.is_null() {
            return 1;
        }
        let node = &*ByKey::node(x);
        if !node.left.is_null() {
            assert_eq!((*ByKey::node(node.left)).parent, x);
            assert!((*node.left).key <= (*x).key);
        }
        if !node.right.is_null() {
            assert_eq!((*ByKey::node(node.right)).parent, x);
            assert!((*node.right).key >= (*x).key);
        }
        if node.red {
            assert!(!RbTree::<TestElem, ByKey>::is_red(node.left), "red-red");
            assert!(!RbTree::<TestElem, ByKey>::is_red(node.right), "red-red");
        }
        let lh = check_subtree(node.left);
        let rh = check_subtree(node.right);
        assert_eq!(lh, rh, "uneven black height");
        lh + if node.red { 0 } else { 1 }
    }

    unsafe fn check_tree(tree: &RbTree<TestElem, ByKey>) {
        if !tree.root.is_null() {
            assert!(!(*ByKey::node(tree.root)).red, "red root");
            assert!((*ByKey::node(tree.root)).parent.is_null());
            check_subtree(tree.root);
        }
    }

    unsafe fn collect_keys(tree: &RbTree<TestElem, ByKey>) -> Vec<u64> {
        tree.iter().map(|e| (*e).key).collect()
    }

    #[test]
    fn insert_remove_ordered() {
        unsafe {
            let mut tree: RbTree<TestElem, ByKey> = RbTree::new();
            let elems: Vec<_> = (0..100u64).map(make).collect();

            // Insert in a mixed order.
            for (i, &e) in elems.iter().enumerate() {
                if i % 2 == 0 {
                    tree.insert(e);
                }
            }
            for (i, &e) in elems.iter().enumerate() {
                if i % 2 == 1 {
                    tree.insert(e);
                }
            }
            check_tree(&tree);
            assert_eq!(collect_keys(&tree), (0..100).collect::<Vec<_>>());
            assert_eq!((*tree.first()).key, 0);
            assert_eq!((*tree.last()).key, 99);

            // prev/next walk the same order.
            let mut cursor = tree.last();
            for expected in (0..99).rev() {
                cursor = tree.prev(cursor);
                assert_eq!((*cursor).key, expected);
            }
            assert!(tree.prev(cursor).is_null());

            // Remove every third element, verifying as we go.
            for (i, &e) in elems.iter().enumerate() {
                if i % 3 == 0 {
                    tree.remove(e);
                    check_tree(&tree);
                }
            }
            let remaining: Vec<u64> = (0..100).filter(|k| k % 3 != 0).collect();
            assert_eq!(collect_keys(&tree), remaining);

            for &e in &elems {
                if (*e).key % 3 != 0 {
                    tree.remove(e);
                }
                free(e);
            }
            assert!(tree.is_empty());
        }
    }

    #[test]
    fn search_or_next_semantics() {
        unsafe {
            let mut tree: RbTree<TestElem, ByKey> = RbTree::new();
            let elems: Vec<_> = [10u64, 20, 30, 40].iter().map(|&k| make(k)).collect();
            for &e in &elems {
                tree.insert(e);
            }

            let key = make(20);
            assert_eq!((*tree.search(key)).key, 20);
            assert_eq!((*tree.search_or_next(key)).key, 20);
            (*key).key = 21;
            assert!(tree.search(key).is_null());
            assert_eq!((*tree.search_or_next(key)).key, 30);
            (*key).key = 41;
            assert!(tree.search_or_next(key).is_null());
            (*key).key = 5;
            assert_eq!((*tree.search_or_next(key)).key, 10);
            free(key);

            for &e in &elems {
                tree.remove(e);
                free(e);
            }
        }
    }

    proptest! {
        // Random interleaved inserts and removes, checked against a
        // BTreeSet model with full invariant validation throughout.
        #[test]
        fn matches_model(ops in proptest::collection::vec((any::<bool>(), 0u64..64), 1..200)) {
            unsafe {
                let mut tree: RbTree<TestElem, ByKey> = RbTree::new();
                let mut model = BTreeSet::new();
                let mut live: Vec<*mut TestElem> = Vec::new();

                for (is_insert, key) in ops {
                    if is_insert {
                        if model.insert(key) {
                            let e = make(key);
                            tree.insert(e);
                            live.push(e);
                        }
                    } else if model.remove(&key) {
                        let pos = live.iter().position(|&e| (*e).key == key).unwrap();
                        let e = live.swap_remove(pos);
                        tree.remove(e);
                        free(e);
                    }
                    check_tree(&tree);
                    let keys = collect_keys(&tree);
                    let expected: Vec<u64> = model.iter().cloned().collect();
                    prop_assert_eq!(keys, expected);
                }

                for e in live {
                    tree.remove(e);
                    free(e);
                }
            }
        }
    }
}
