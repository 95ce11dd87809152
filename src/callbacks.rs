//! Callback registry that tolerates removal while notifying.
//!
//! Removing a callback from inside a running notification leaves a tombstone
//! in its slot; slots are compacted once the outermost notification returns.
//! Callbacks added during a notification first fire on the next one.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Slot<A> {
    id: u64,
    owner: Option<String>,
    callback: Rc<dyn Fn(&A)>,
}

pub struct CallbackRegistry<A> {
    slots: RefCell<Vec<Option<Slot<A>>>>,
    next_id: Cell<u64>,
    depth: Cell<usize>,
}

impl<A> Default for CallbackRegistry<A> {
    fn default() -> Self {
        CallbackRegistry {
            slots: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            depth: Cell::new(0),
        }
    }
}

impl<A> CallbackRegistry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback, optionally tagged with an owner for bulk removal.
    pub fn add<F>(&self, owner: Option<&str>, callback: F) -> u64
    where
        F: Fn(&A) + 'static,
    {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.slots.borrow_mut().push(Some(Slot {
            id,
            owner: owner.map(str::to_string),
            callback: Rc::new(callback),
        }));
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        self.remove_where(|slot| slot.id == id) > 0
    }

    /// Removes every callback tagged with `owner`.
    pub fn remove_owner(&self, owner: &str) -> usize {
        self.remove_where(|slot| slot.owner.as_deref() == Some(owner))
    }

    pub fn clear(&self) {
        self.remove_where(|_| true);
    }

    fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Slot<A>) -> bool,
    {
        let mut slots = self.slots.borrow_mut();
        let mut removed = 0;
        for entry in slots.iter_mut() {
            if entry.as_ref().is_some_and(&predicate) {
                *entry = None;
                removed += 1;
            }
        }
        if self.depth.get() == 0 {
            slots.retain(Option::is_some);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every live callback in registration order.
    pub fn notify(&self, arg: &A) {
        self.depth.set(self.depth.get() + 1);
        let count = self.slots.borrow().len();
        for ix in 0..count {
            let callback = self
                .slots
                .borrow()
                .get(ix)
                .and_then(|slot| slot.as_ref().map(|s| s.callback.clone()));
            if let Some(callback) = callback {
                callback(arg);
            }
        }
        self.depth.set(self.depth.get() - 1);
        if self.depth.get() == 0 {
            self.slots.borrow_mut().retain(Option::is_some);
        }
    }
}
