use crate::codec::LogEvent;
use crate::error::{Error, Result};

use super::{EventIterator, IteratorPos};

/// Decides which of two candidate events is served first. Returns true
/// when the first one wins.
pub type SelectFn = fn(&LogEvent, &LogEvent) -> bool;

/// Always prefers the first child. Useful for plain concatenation.
pub fn first_wins(_: &LogEvent, _: &LogEvent) -> bool {
    true
}

/// Prefers the event with the lower timestamp; on a tie the first child
/// wins, which keeps merging stable in child insertion order.
pub fn earliest_first(a: &LogEvent, b: &LogEvent) -> bool {
    a.ts <= b.ts
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Choice {
    Undecided,
    First,
    Second,
    Done,
}

/// Merges two child iterators into one ordered stream.
///
/// The selector is consulted in forward mode; in backward mode its choice
/// is inverted, which turns an ascending merge into the matching
/// descending one. `next` advances only the chosen child. A direction
/// flip clears the cached choice and lets the children re-anchor on their
/// pinned records.
pub struct Mixer {
    sel: SelectFn,
    i1: Box<dyn EventIterator>,
    i2: Box<dyn EventIterator>,
    bkwd: bool,
    choice: Choice,
    err: Option<Error>,
}

impl Mixer {
    pub fn new(sel: SelectFn, i1: Box<dyn EventIterator>, i2: Box<dyn EventIterator>) -> Mixer {
        Mixer {
            sel,
            i1,
            i2,
            bkwd: false,
            choice: Choice::Undecided,
            err: None,
        }
    }

    fn select(&mut self) {
        // end of data is recoverable: a child may have grown since
        if self.choice == Choice::Done
            && matches!(self.err, Some(Error::Eof))
            && !(self.i1.end() && self.i2.end())
        {
            self.choice = Choice::Undecided;
            self.err = None;
        }
        if self.choice != Choice::Undecided {
            return;
        }

        let e1 = self.i1.end();
        let e2 = self.i2.end();
        if e1 && e2 {
            self.choice = Choice::Done;
            self.err = Some(Error::Eof);
            return;
        }
        if e1 {
            self.choice = Choice::Second;
            return;
        }
        if e2 {
            self.choice = Choice::First;
            return;
        }

        let mut ev1 = LogEvent::default();
        if let Err(err) = self.i1.get(&mut ev1) {
            self.choice = Choice::Done;
            self.err = Some(err);
            return;
        }
        let mut ev2 = LogEvent::default();
        if let Err(err) = self.i2.get(&mut ev2) {
            self.choice = Choice::Done;
            self.err = Some(err);
            return;
        }

        // backward mode inverts the selection
        self.choice = if (self.sel)(&ev1, &ev2) != self.bkwd {
            Choice::First
        } else {
            Choice::Second
        };
    }

    fn take_err(&self) -> Error {
        match &self.err {
            Some(Error::Eof) | None => Error::Eof,
            Some(other) => Error::transient(other.to_string()),
        }
    }
}

impl EventIterator for Mixer {
    fn end(&mut self) -> bool {
        self.i1.end() && self.i2.end()
    }

    fn get(&mut self, out: &mut LogEvent) -> Result<()> {
        self.select();
        match self.choice {
            Choice::First => self.i1.get(out),
            Choice::Second => self.i2.get(out),
            _ => Err(self.take_err()),
        }
    }

    fn next(&mut self) {
        self.select();
        match self.choice {
            Choice::First => self.i1.next(),
            Choice::Second => self.i2.next(),
            _ => {}
        }
        self.choice = Choice::Undecided;
    }

    fn backward(&mut self, bkwd: bool) {
        if self.bkwd == bkwd {
            return;
        }
        self.i1.backward(bkwd);
        self.i2.backward(bkwd);
        self.bkwd = bkwd;
        self.choice = Choice::Undecided;
        if matches!(self.err, Some(Error::Eof)) {
            self.err = None;
        }
    }

    fn iterator_pos(&mut self) -> Option<IteratorPos> {
        self.select();
        match self.choice {
            Choice::First => self.i1.iterator_pos(),
            Choice::Second => self.i2.iterator_pos(),
            _ => None,
        }
    }

    fn close(&mut self) -> Result<()> {
        let r1 = self.i1.close();
        let r2 = self.i2.close();
        r1.and(r2)
    }
}

/// Builds a balanced binary tree of mixers over the given iterators.
/// A single iterator is returned as is.
pub fn build_merge_tree(
    sel: SelectFn,
    its: Vec<Box<dyn EventIterator>>,
) -> Option<Box<dyn EventIterator>> {
    let mut level = its;
    if level.is_empty() {
        return None;
    }
    while level.len() > 1 {
        let mut next: Vec<Box<dyn EventIterator>> = Vec::with_capacity(level.len() / 2 + 1);
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(Box::new(Mixer::new(sel, a, b))),
                None => next.push(a),
            }
        }
        level = next;
    }
    level.pop()
}
