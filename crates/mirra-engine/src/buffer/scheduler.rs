use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::mirrored::MirrorInner;
use super::BufferError;
use crate::device::BufferDevice;

/// End-of-turn queue of deferred mirror flushes.
///
/// A [`MirroredBuffer`](super::MirroredBuffer) enqueues itself here when a
/// `set` moves it from clean to dirty. The owner of the loop calls
/// [`run`](Self::run) once per turn: after every edit of that turn has been
/// applied and before the next frame is encoded. All edits of the turn are
/// then uploaded with one write per mirror.
///
/// Each mirror has at most one entry in the queue at a time. Clones share one
/// queue. The queue only holds weak references, so dropping a mirror with a
/// pending flush simply cancels it.
pub struct FlushScheduler<D: BufferDevice> {
    queue: Rc<RefCell<Vec<Weak<MirrorInner<D>>>>>,
}

impl<D: BufferDevice> FlushScheduler<D> {
    pub fn new() -> Self {
        Self {
            queue: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Number of flushes waiting for the next [`run`](Self::run).
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    pub(crate) fn schedule(&self, mirror: &Rc<MirrorInner<D>>) {
        if mirror.mark_queued() {
            log::trace!("{}: flush scheduled", mirror.label());
            self.queue.borrow_mut().push(Rc::downgrade(mirror));
        }
    }

    /// Flushes every queued mirror that is still alive.
    ///
    /// Every queued mirror is attempted even if an earlier one fails; the first
    /// failure is returned. On success, returns how many mirrors were written.
    /// Edits made while this runs are queued for the next call.
    pub async fn run(&self) -> Result<usize, BufferError> {
        let due = std::mem::take(&mut *self.queue.borrow_mut());

        let mut flushed = 0;
        let mut first_error = None;
        for mirror in due.iter().filter_map(Weak::upgrade) {
            mirror.clear_queued();
            match mirror.flush().await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(err) => {
                    log::error!("{}: flush failed: {err}", mirror.label());
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(flushed),
        }
    }

    /// [`run`](Self::run), blocking the current thread until it completes.
    pub fn run_blocking(&self) -> Result<usize, BufferError> {
        pollster::block_on(self.run())
    }
}

impl<D: BufferDevice> Clone for FlushScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            queue: Rc::clone(&self.queue),
        }
    }
}

impl<D: BufferDevice> Default for FlushScheduler<D> {
    fn default() -> Self {
        Self::new()
    }
}
