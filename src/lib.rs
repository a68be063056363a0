//! Filament is a user-space coroutine runtime for network servers.
//!
//! It multiplexes many lightweight [fibers](fiber) onto a small pool of OS
//! threads and converts blocking socket calls issued from fibers into
//! event-driven waits on `epoll`. The pieces fit together like this:
//!
//! - [Fibers](fiber): stack-switched execution contexts with an explicit
//!   lifecycle.
//! - [Scheduler](scheduler): M:N dispatch over a thread pool with a FIFO
//!   queue and per-task thread affinity.
//! - [Timer wheel](timer): deadline-ordered one-shot and periodic callbacks.
//! - [IoReactor](reactor): the scheduler extended with a readiness loop and
//!   a per-descriptor event registry.
//! - [Hook layer](hook): replacement entry points for the blocking I/O
//!   family that suspend the calling fiber until readiness or deadline.
//!
//! Supporting modules: [descriptor metadata registry](fd),
//! [configuration](config), [logging](log), [clock](clock) and a
//! [thread wrapper](thread).
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let reactor = filament::reactor::IoReactor::new(2, false, "demo").unwrap();
//! reactor.schedule(|| {
//!     // Blocking calls made through the hook layer suspend this fiber
//!     // instead of the worker thread.
//!     filament::fiber::sleep(Duration::from_millis(100));
//!     log::info!(target: "system", "woke up");
//! });
//! reactor.stop();
//! ```
//!
//! Only Linux is supported: the reactor is built directly on `epoll`.

#[macro_use]
pub mod util;

pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod log;
pub mod reactor;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use error::{Error, Result};
