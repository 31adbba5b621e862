//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use tracing_subscriber::EnvFilter;

/// Route library logs to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Append-only record of which slots fired, in order.
#[derive(Clone, Default)]
pub struct CallLog<T> {
    calls: Rc<RefCell<Vec<T>>>,
}

impl<T: Clone> CallLog<T> {
    pub fn new() -> Self {
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.calls.borrow_mut().push(value);
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.calls.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.borrow().len()
    }
}
