//! Named OS-thread wrapper.
//!
//! Workers spawned through [`Thread::spawn`] publish their kernel thread id
//! before the constructor returns, so the scheduler can hand out affinity
//! hints for a worker immediately after creating it. The per-thread name is
//! kept in thread-local storage for the logger.

use std::cell::RefCell;
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::util;

thread_local! {
    static CURRENT_NAME: RefCell<String> = RefCell::new(String::from("main"));
}

/// Name of the calling thread as set by [`set_current_name`].
pub fn current_name() -> String {
    CURRENT_NAME.with(|name| name.borrow().clone())
}

/// Renames the calling thread for logging purposes.
pub fn set_current_name(name: &str) {
    CURRENT_NAME.with(|current| *current.borrow_mut() = name.to_owned());
}

/// A joinable named thread with a known kernel thread id.
pub struct Thread {
    id: libc::pid_t,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `f` on a new thread named `name`.
    ///
    /// Blocks until the thread has started far enough to report its kernel
    /// id; `f` itself runs unsynchronized.
    pub fn spawn<F>(name: &str, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let thread_name = name.to_owned();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                set_current_name(&thread_name);
                // The receiver lives until recv returns, send cannot fail.
                let _ = tx.send(util::thread_id());
                f();
            })
            .map_err(|source| Error::ThreadSpawn {
                name: name.to_owned(),
                source,
            })?;
        let id = rx.recv().expect("spawned thread exited before reporting its id");
        Ok(Thread {
            id,
            name: name.to_owned(),
            handle: Some(handle),
        })
    }

    /// Kernel thread id (`gettid`) of the wrapped thread.
    #[inline]
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(target: "system", "thread {} panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_reports_child_id_and_name() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn("worker-test", move || {
            tx.send((util::thread_id(), current_name())).unwrap();
        })
        .unwrap();
        let (child_id, child_name) = rx.recv().unwrap();
        assert_eq!(t.id(), child_id);
        assert_eq!(child_name, "worker-test");
        assert_ne!(t.id(), util::thread_id());
        t.join();
    }
}
