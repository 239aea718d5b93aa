use std::sync::{Condvar, Mutex};

/// One-shot signal: opens once, and every waiter (past or future) proceeds.
#[derive(Debug, Default)]
pub struct Gate {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the gate was already open.
    pub fn open(&self) -> bool {
        let mut opened = self.opened.lock().expect("gate lock");
        if *opened {
            return false;
        }
        *opened = true;
        self.cond.notify_all();
        true
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock().expect("gate lock")
    }

    pub fn wait(&self) {
        let mut opened = self.opened.lock().expect("gate lock");
        while !*opened {
            opened = self.cond.wait(opened).expect("gate lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn opens_once() {
        let gate = Gate::new();
        assert!(gate.open());
        assert!(!gate.open());
        gate.wait();
        assert!(gate.is_open());
    }

    #[test]
    fn releases_waiters() {
        let gate = Arc::new(Gate::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait())
            })
            .collect();
        gate.open();
        for waiter in waiters {
            waiter.join().expect("join");
        }
    }
}
