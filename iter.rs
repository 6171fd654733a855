//! Range cursors.
//!
//! When a write batch is active, every scan must reflect the union of the
//! batch over the durable store, with batch writes winning on conflict and
//! batch tombstones suppressing stored rows. [`MergedRange`] interleaves the
//! batch's sorted view with a backend cursor; [`EntryIter`] layers decoding
//! and the expiration check on top.

use crate::api::{Direction, RangeIter};
use crate::codec;
use crate::error::StoreError;
use crate::store::{Entry, Store};
use bytes::Bytes;

/// Two-way merge of the batch overlay and a backend cursor over one table.
///
/// Both inputs are ordered in the scan direction. `None` overlay slots are
/// tombstones: they consume the matching backend row and yield nothing.
pub(crate) struct MergedRange<'a> {
    base: std::iter::Peekable<RangeIter<'a>>,
    overlay: std::iter::Peekable<std::vec::IntoIter<(u64, Option<Vec<u8>>)>>,
    direction: Direction,
}

impl<'a> MergedRange<'a> {
    pub(crate) fn new(
        base: RangeIter<'a>,
        overlay: Vec<(u64, Option<Vec<u8>>)>,
        direction: Direction,
    ) -> Self {
        Self {
            base: base.peekable(),
            overlay: overlay.into_iter().peekable(),
            direction,
        }
    }
}

impl Iterator for MergedRange<'_> {
    type Item = Result<(u64, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let overlay_key = match self.overlay.peek() {
                Some((key, _)) => Some(*key),
                None => None,
            };
            let base_key = match self.base.peek() {
                Some(Ok((key, _))) => Some(*key),
                // Surface backend errors as soon as they are reached
                Some(Err(_)) => return self.base.next(),
                None => None,
            };

            match (overlay_key, base_key) {
                (None, None) => return None,
                (None, Some(_)) => return self.base.next(),
                (Some(_), None) => {
                    let Some((key, slot)) = self.overlay.next() else {
                        return None;
                    };
                    match slot {
                        Some(value) => return Some(Ok((key, value))),
                        None => continue, // tombstone over nothing
                    }
                }
                (Some(ok), Some(bk)) => {
                    if ok == bk {
                        // Batch supersedes the stored row
                        let _ = self.base.next();
                    }
                    let overlay_first = match self.direction {
                        Direction::Forward => ok <= bk,
                        Direction::Reverse => ok >= bk,
                    };
                    if overlay_first {
                        let Some((key, slot)) = self.overlay.next() else {
                            return None;
                        };
                        match slot {
                            Some(value) => return Some(Ok((key, value))),
                            None => continue, // tombstone suppressed the row
                        }
                    } else {
                        return self.base.next();
                    }
                }
            }
        }
    }
}

/// Cursor over the live entries of a key range.
///
/// Snapshots the batch overlay at creation; the expiration clock is also
/// fixed at creation so one scan sees one consistent notion of "now".
/// Any mutation on the owning store invalidates in-flight cursors.
pub struct EntryIter<'a> {
    store: &'a Store,
    inner: MergedRange<'a>,
    now_ms: u64,
}

impl<'a> EntryIter<'a> {
    pub(crate) fn new(store: &'a Store, inner: MergedRange<'a>, now_ms: u64) -> Self {
        Self {
            store,
            inner,
            now_ms,
        }
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<Entry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, packed) = match self.inner.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };
            match self.store.ttl_deadline(key) {
                Ok(Some(deadline)) if deadline <= self.now_ms => continue, // expired
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
            let (term, cmd, data) = codec::unpack_value(&packed);
            return Some(Ok(Entry::new(key, term, cmd, Bytes::copy_from_slice(data))));
        }
    }
}
