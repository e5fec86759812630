use std::task::Waker;

/// Index of one waker's entry in a [`WakerSet`]. Tokens are deliberately
/// not cloneable, so that each one is owned by exactly one future and its
/// lifespan matches that future's interest in the shared computation.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Token(usize);

/// Data structure for managing a collection of wakers that are all
/// interested in a single shared computation. Only one task needs to do the
/// work of driving that computation forward, but other tasks must be able
/// to take its place if it is dropped.
///
/// A future registers its waker with `register`, which hands back a token
/// (or refreshes the entry for a token from an earlier poll). The most
/// recently registered waker is the "driving waker": the one assumed to be
/// polling the computation right now. If a future loses interest, `abandon`
/// removes its waker and, if it was the driver, wakes an arbitrary survivor
/// so the chain of drivers is never broken. When the computation finishes,
/// `complete` wakes every remaining waker at once.
///
/// Entries live in a plain slab; tokens are indices into it. Slots are
/// never reused, on the assumption that a WakerSet is short-lived and only
/// ever sees a handful of distinct futures.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    entries: Vec<Option<Waker>>,
    driver: Option<usize>,
}

impl WakerSet {
    /// Insert or refresh the waker owned by `token`, and mark it as the
    /// current driving waker. A `None` token means this future has not
    /// registered before; a fresh entry is created and the token stored.
    ///
    /// Panics if the token refers to an entry that was already discarded.
    /// That would mean a future kept using a token past its own drop
    /// handler, which is a logic error.
    pub(crate) fn register(&mut self, token: &mut Option<Token>, waker: &Waker) {
        match token {
            Some(token) => {
                self.entries[token.0]
                    .as_mut()
                    .expect("attempted to refresh a discarded waker entry")
                    .clone_from(waker);
                self.driver = Some(token.0);
            }
            None => {
                let index = self.entries.len();
                self.entries.push(Some(waker.clone()));
                self.driver = Some(index);
                *token = Some(Token(index));
            }
        }
    }

    /// Remove a waker without any handover. Use this only when the owning
    /// future has already observed the finished computation and no longer
    /// needs a replacement driver.
    pub(crate) fn discard(&mut self, token: Token) {
        self.entries[token.0] = None;
        if self.driver == Some(token.0) {
            self.driver = None;
        }
    }

    /// Remove a waker whose future was dropped mid-computation. If that
    /// waker was the driver (or no driver is currently known), an arbitrary
    /// surviving waker is promoted to driver and woken, so that some task
    /// re-polls and the computation keeps making progress.
    pub(crate) fn abandon(&mut self, token: Token) {
        self.entries[token.0] = None;
        if self.driver == Some(token.0) || self.driver.is_none() {
            self.driver = None;
            let next = self
                .entries
                .iter()
                .enumerate()
                .find_map(|(index, entry)| entry.as_ref().map(|waker| (index, waker)));
            if let Some((index, waker)) = next {
                self.driver = Some(index);
                waker.wake_by_ref();
            }
        }
    }

    /// Wake every registered waker without removing any entry. Used when
    /// the computation the set guards has newly become pollable and every
    /// interested task should come back and re-poll (one of them will end
    /// up as the driver).
    pub(crate) fn rouse(&self) {
        for waker in self.entries.iter().flatten() {
            waker.wake_by_ref();
        }
    }

    /// The computation finished: wake every registered waker, except the
    /// one owned by `skip` (that task just finished the work itself and is
    /// about to take its own result without going back to sleep).
    ///
    /// Entries are emptied in place rather than truncated, so that tokens
    /// still held by not-yet-dropped futures stay valid (their `discard`
    /// and `abandon` calls become no-ops).
    pub(crate) fn complete(&mut self, skip: Option<Token>) {
        let skip = skip.map(|token| token.0);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(waker) = entry.take() {
                if Some(index) != skip {
                    waker.wake();
                }
            }
        }
        self.driver = None;
    }
}
