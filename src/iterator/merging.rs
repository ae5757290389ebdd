use std::sync::Arc;

use crate::{comparator::Comparator, error::Result};

use super::{BoxedIterator, DBIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge of sorted children.
///
/// Children are scanned linearly to find the smallest (or largest) key, the number of
/// children is small: the memtables, level-0 files and one iterator per deeper level.
/// Equal keys are yielded in children order, so earlier children win ties.
pub(crate) struct MergingIterator {
    cmp: Arc<dyn Comparator>,
    children: Vec<BoxedIterator>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub(crate) fn new(cmp: Arc<dyn Comparator>, children: Vec<BoxedIterator>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.is_valid() {
                continue;
            }
            match smallest {
                Some(s) if self.cmp.compare(child.key(), self.children[s].key()).is_ge() => {}
                _ => smallest = Some(i),
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.is_valid() {
                continue;
            }
            match largest {
                Some(l) if self.cmp.compare(child.key(), self.children[l].key()).is_le() => {}
                _ => largest = Some(i),
            }
        }
        self.current = largest;
    }
}

impl DBIterator for MergingIterator {
    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let Some(current) = self.current else {
            return;
        };

        // Every non-current child must be positioned after key(). Entering forward mode
        // from reverse moves each of them to the first entry past key().
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.is_valid() && self.cmp.compare(&key, child.key()).is_eq() {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let Some(current) = self.current else {
            return;
        };

        // Every non-current child must be positioned before key().
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.is_valid() {
                    // first entry >= key, step before it
                    child.prev();
                } else {
                    // no entries >= key, the last one is before it
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        for child in self.children.iter() {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        comparator::BytewiseComparator,
        error::{Error, Result},
        iterator::{
            tests::{collect_backward, collect_forward},
            BoxedIterator, DBIterator, EmptyIterator,
        },
    };

    use super::MergingIterator;

    /// Sorted in-memory source.
    pub(crate) struct VecIterator {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIterator {
        pub(crate) fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            entries.sort();
            Self { entries, pos: None }
        }
    }

    impl DBIterator for VecIterator {
        fn is_valid(&self) -> bool {
            self.pos.is_some()
        }

        fn seek_to_first(&mut self) {
            self.pos = (!self.entries.is_empty()).then_some(0);
        }

        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }

        fn seek(&mut self, target: &[u8]) {
            let i = self.entries.partition_point(|(k, _)| k.as_slice() < target);
            self.pos = (i < self.entries.len()).then_some(i);
        }

        fn next(&mut self) {
            self.pos = self
                .pos
                .map(|p| p + 1)
                .filter(|&p| p < self.entries.len());
        }

        fn prev(&mut self) {
            self.pos = self.pos.and_then(|p| p.checked_sub(1));
        }

        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }

        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    fn source(keys: &[&str]) -> BoxedIterator {
        Box::new(VecIterator::new(
            keys.iter()
                .map(|k| (k.as_bytes().to_vec(), k.as_bytes().to_vec()))
                .collect(),
        ))
    }

    fn keys(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<String> {
        entries
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect()
    }

    fn merging() -> MergingIterator {
        MergingIterator::new(
            Arc::new(BytewiseComparator),
            vec![
                source(&["a", "d", "g"]),
                source(&[]),
                source(&["b", "e", "h"]),
                source(&["c", "f", "i"]),
            ],
        )
    }

    #[test]
    fn forward_and_backward() {
        let mut iter = merging();
        iter.seek_to_first();
        assert_eq!(
            keys(collect_forward(&mut iter)),
            vec!["a", "b", "c", "d", "e", "f", "g", "h", "i"]
        );

        iter.seek_to_last();
        assert_eq!(
            keys(collect_backward(&mut iter)),
            vec!["i", "h", "g", "f", "e", "d", "c", "b", "a"]
        );
    }

    #[test]
    fn switch_direction() {
        let mut iter = merging();
        iter.seek(b"e");
        assert_eq!(iter.key(), b"e");
        iter.prev();
        assert_eq!(iter.key(), b"d");
        iter.prev();
        assert_eq!(iter.key(), b"c");
        iter.next();
        assert_eq!(iter.key(), b"d");
        iter.next();
        assert_eq!(iter.key(), b"e");

        iter.seek(b"zzz");
        assert!(!iter.is_valid());
        iter.seek(b"");
        assert_eq!(iter.key(), b"a");
        iter.prev();
        assert!(!iter.is_valid());
    }

    #[test]
    fn duplicate_keys_keep_child_order() {
        let mut iter = MergingIterator::new(
            Arc::new(BytewiseComparator),
            vec![
                Box::new(VecIterator::new(vec![(b"k".to_vec(), b"new".to_vec())])),
                Box::new(VecIterator::new(vec![(b"k".to_vec(), b"old".to_vec())])),
            ],
        );
        iter.seek_to_first();
        assert_eq!(iter.value(), b"new");
        iter.next();
        assert_eq!(iter.value(), b"old");
        iter.next();
        assert!(!iter.is_valid());
    }

    #[test]
    fn status_from_children() {
        let iter = MergingIterator::new(
            Arc::new(BytewiseComparator),
            vec![
                source(&["a"]),
                Box::new(EmptyIterator::with_error(Error::Corruption("x".into()))),
            ],
        );
        assert!(iter.status().is_err());
    }
}
