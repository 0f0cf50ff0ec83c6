// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use parking_lot::Mutex;
use std::sync::Arc;

/// Registry of observers notified outside any internal lock. `notify` runs
/// the callback against a snapshot of the current registration set, so an
/// observer may add or remove observers (including itself) from inside a
/// callback without deadlocking.
pub struct ObserverList<T: ?Sized> {
    observers: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> ObserverList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, observer: Arc<T>) {
        let mut observers = self.observers.lock();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    /// Removes by identity. Returns whether the observer was registered.
    pub fn remove(&self, observer: &Arc<T>) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn notify(&self, f: impl Fn(&T)) {
        let snapshot: Vec<Arc<T>> = self.observers.lock().clone();
        for observer in &snapshot {
            f(observer);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}
