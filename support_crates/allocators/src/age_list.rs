use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, Default)]
struct Link {
    newer: Option<usize>,
    older: Option<usize>,
    linked: bool,
}

/// An intrusive doubly linked list over indices, ordered from most to least recently used.
///
/// The list does not own the elements it orders. It only stores the links for every index that is part of
/// it, so the table holding the actual elements can keep addressing them by index while the list tracks
/// their age. All operations are `O(1)` except iteration.
#[derive(Debug, Clone, Default)]
pub struct AgeList {
    links: Vec<Link>,
    newest: Option<usize>,
    oldest: Option<usize>,
    len: usize,
}

impl AgeList {
    pub const fn new() -> Self {
        Self {
            links: Vec::new(),
            newest: None,
            oldest: None,
            len: 0,
        }
    }

    fn link_mut(&mut self, index: usize) -> &mut Link {
        if index >= self.links.len() {
            self.links.resize(index + 1, Link::default());
        }
        &mut self.links[index]
    }

    /// Whether `index` is currently part of the list
    pub fn contains(&self, index: usize) -> bool {
        self.links.get(index).map(|l| l.linked).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The most recently used index
    pub fn newest(&self) -> Option<usize> {
        self.newest
    }

    /// The least recently used index which is the natural candidate for recycling
    pub fn oldest(&self) -> Option<usize> {
        self.oldest
    }

    /// Insert `index` as the most recently used element.
    ///
    /// # Panics
    /// Panics if `index` is already part of the list.
    pub fn push_newest(&mut self, index: usize) {
        assert!(!self.contains(index), "index {index} is already linked");
        let old_newest = self.newest;
        *self.link_mut(index) = Link {
            newer: None,
            older: old_newest,
            linked: true,
        };
        match old_newest {
            Some(n) => self.links[n].newer = Some(index),
            None => self.oldest = Some(index),
        }
        self.newest = Some(index);
        self.len += 1;
    }

    /// Insert `index` as the least recently used element.
    ///
    /// # Panics
    /// Panics if `index` is already part of the list.
    pub fn push_oldest(&mut self, index: usize) {
        assert!(!self.contains(index), "index {index} is already linked");
        let old_oldest = self.oldest;
        *self.link_mut(index) = Link {
            newer: old_oldest,
            older: None,
            linked: true,
        };
        match old_oldest {
            Some(o) => self.links[o].older = Some(index),
            None => self.newest = Some(index),
        }
        self.oldest = Some(index);
        self.len += 1;
    }

    /// Unlink `index` from the list, returning whether it was linked at all
    pub fn remove(&mut self, index: usize) -> bool {
        if !self.contains(index) {
            return false;
        }
        let link = self.links[index];
        match link.newer {
            Some(n) => self.links[n].older = link.older,
            None => self.newest = link.older,
        }
        match link.older {
            Some(o) => self.links[o].newer = link.newer,
            None => self.oldest = link.newer,
        }
        self.links[index] = Link::default();
        self.len -= 1;
        true
    }

    /// Mark `index` as just used
    pub fn touch(&mut self, index: usize) {
        self.remove(index);
        self.push_newest(index);
    }

    /// Mark `index` as the first candidate for recycling
    pub fn retire(&mut self, index: usize) {
        self.remove(index);
        self.push_oldest(index);
    }

    /// Iterate over all linked indices starting with the least recently used one
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.oldest;
        core::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.links[current].newer;
            Some(current)
        })
    }
}
