//! Restartable lazy page sequences handed to the training loop.
//!
//! A [`Batches`] hides which concrete source backs it: either a shared page
//! source (primary or derived, cached on disk) or a single in-memory page
//! (the non-weighted histogram regime). Iterating pulls pages one at a time;
//! each pull may block on disk I/O or on the external iterator's callback.
//!
//! Two `Batches` handles over the same source share position; the position
//! lives in the source, not the handle. The orchestrator resets the source
//! every time it hands out a new sequence, so successive "get batches" calls
//! each traverse the full page sequence from the start.

use std::sync::{Arc, Mutex};

use crate::source::PageSource;

enum Backing<P> {
    Source(Arc<Mutex<dyn PageSource<Page = P>>>),
    Single(Option<Arc<P>>),
}

/// A restartable lazy sequence of pages of one format.
pub struct Batches<P> {
    backing: Backing<P>,
}

impl<P> Batches<P> {
    pub(crate) fn from_source(source: Arc<Mutex<dyn PageSource<Page = P>>>) -> Self {
        Self {
            backing: Backing::Source(source),
        }
    }

    pub(crate) fn single(page: Arc<P>) -> Self {
        Self {
            backing: Backing::Single(Some(page)),
        }
    }
}

impl<P> Iterator for Batches<P> {
    type Item = Arc<P>;

    fn next(&mut self) -> Option<Arc<P>> {
        match &mut self.backing {
            Backing::Source(source) => source.lock().unwrap().advance(),
            Backing::Single(page) => page.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSource {
        next: u32,
        limit: u32,
    }

    impl PageSource for CountingSource {
        type Page = u32;

        fn reset(&mut self) {
            self.next = 0;
        }

        fn advance(&mut self) -> Option<Arc<u32>> {
            if self.next >= self.limit {
                return None;
            }
            let page = Arc::new(self.next);
            self.next += 1;
            Some(page)
        }
    }

    #[test]
    fn single_page_yields_exactly_once() {
        let mut batches = Batches::single(Arc::new(7u32));
        assert_eq!(*batches.next().unwrap(), 7);
        assert!(batches.next().is_none());
        assert!(batches.next().is_none());
    }

    #[test]
    fn handles_over_one_source_share_position() {
        let source: Arc<Mutex<dyn PageSource<Page = u32>>> = Arc::new(Mutex::new(CountingSource {
            next: 0,
            limit: 3,
        }));
        let mut a = Batches::from_source(Arc::clone(&source));
        let mut b = Batches::from_source(Arc::clone(&source));
        assert_eq!(*a.next().unwrap(), 0);
        assert_eq!(*b.next().unwrap(), 1);
        assert_eq!(*a.next().unwrap(), 2);
        assert!(b.next().is_none());
    }
}
