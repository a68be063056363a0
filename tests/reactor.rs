//! Reactor-level scenarios: scheduling order, event cancellation,
//! re-registration, periodic timers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filament::fiber::{self, Fiber};
use filament::reactor::{Interest, IoReactor};

fn socketpair() -> (libc::c_int, libc::c_int) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn two_fibers_one_yield() {
    let reactor = IoReactor::new(1, true, "two-fibers").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_a = order.clone();
    let fiber_a = Fiber::new(
        move || {
            order_a.lock().unwrap().push("A1");
            fiber::yield_suspended();
            order_a.lock().unwrap().push("A2");
        },
        0,
    );
    let order_b = order.clone();
    let fiber_b = Fiber::new(
        move || {
            order_b.lock().unwrap().push("B");
        },
        0,
    );

    reactor.schedule_fiber(fiber_a.clone());
    reactor.schedule_fiber(fiber_b);
    {
        // Resume A explicitly once the timer fires.
        let weak = Arc::downgrade(&reactor);
        reactor.add_timer(
            10,
            move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.schedule_fiber(fiber_a.clone());
                }
            },
            false,
        );
    }
    reactor.stop();

    assert_eq!(*order.lock().unwrap(), vec!["A1", "B", "A2"]);
}

#[test]
fn cancel_event_resumes_waiter_without_timeout() {
    let reactor = IoReactor::new(1, false, "cancel-event");
    let reactor = reactor.unwrap();
    let (fd_a, fd_b) = socketpair();
    let (tx, rx) = mpsc::channel();

    {
        let reactor_in = reactor.clone();
        reactor.schedule(move || {
            // No data is ever written: only cancel_event can wake us.
            reactor_in.add_event(fd_a, Interest::READ, None).unwrap();
            fiber::yield_suspended();
            tx.send("resumed").unwrap();
        });
    }
    // Wait for the waiter fiber to park itself.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while reactor.pending_events() != 1 {
        assert!(std::time::Instant::now() < deadline, "waiter never registered");
        std::thread::sleep(Duration::from_millis(10));
    }

    {
        let reactor_in = reactor.clone();
        reactor.schedule(move || {
            assert!(reactor_in.cancel_event(fd_a, Interest::READ));
        });
    }
    let resumed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(resumed, "resumed");

    reactor.stop();
    assert_eq!(reactor.pending_events(), 0);
    unsafe {
        libc::close(fd_a);
        libc::close(fd_b);
    }
}

#[test]
fn refire_needs_reregistration_and_keeps_callbacks_separate() {
    let reactor = IoReactor::new(1, false, "re-register").unwrap();
    let (fd_read, fd_write) = socketpair();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let drain = |fd: libc::c_int| {
        let mut buf = [0u8; 16];
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    };

    {
        let first = first.clone();
        reactor
            .add_event(fd_read, Interest::READ, Some(Box::new(move || {
                first.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
    }
    assert_eq!(unsafe { libc::write(fd_write, b"x".as_ptr() as *const _, 1) }, 1);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.pending_events(), 0);
    drain(fd_read);

    // A delivered interest is gone: registering the same direction again
    // must be accepted, and only the new callback may fire.
    {
        let second = second.clone();
        reactor
            .add_event(fd_read, Interest::READ, Some(Box::new(move || {
                second.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
    }
    assert_eq!(unsafe { libc::write(fd_write, b"y".as_ptr() as *const _, 1) }, 1);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    reactor.stop();
    unsafe {
        libc::close(fd_read);
        libc::close(fd_write);
    }
}

#[test]
fn periodic_timer_cancelled_from_its_own_callback() {
    let reactor = IoReactor::new(1, false, "periodic-cancel").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));
    let handle: Arc<Mutex<Option<Arc<filament::timer::Timer>>>> = Arc::new(Mutex::new(None));

    let timer = {
        let fires = fires.clone();
        let handle = handle.clone();
        reactor.add_timer(
            1000,
            move || {
                let n = fires.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    if let Some(timer) = handle.lock().unwrap().as_ref() {
                        assert!(timer.cancel());
                    }
                }
            },
            true,
        )
    };
    *handle.lock().unwrap() = Some(timer);

    // Three fires at roughly 1s spacing, then silence.
    std::thread::sleep(Duration::from_millis(3500));
    assert_eq!(fires.load(Ordering::SeqCst), 3);
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(fires.load(Ordering::SeqCst), 3);

    reactor.stop();
}

#[test]
fn del_event_does_not_invoke_callback() {
    let reactor = IoReactor::new(1, false, "del-event").unwrap();
    let (fd_a, fd_b) = socketpair();
    let fired = Arc::new(AtomicUsize::new(0));

    {
        let fired = fired.clone();
        reactor
            .add_event(fd_a, Interest::READ, Some(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
    }
    assert_eq!(reactor.pending_events(), 1);
    assert!(reactor.del_event(fd_a, Interest::READ));
    assert_eq!(reactor.pending_events(), 0);
    // Readiness after deletion goes nowhere.
    assert_eq!(unsafe { libc::write(fd_b, b"x".as_ptr() as *const _, 1) }, 1);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    reactor.stop();
    unsafe {
        libc::close(fd_a);
        libc::close(fd_b);
    }
}

#[test]
fn switch_to_moves_fiber_between_workers() {
    let reactor = IoReactor::new(2, false, "switch-to").unwrap();
    let ids = reactor.thread_ids();
    assert_eq!(ids.len(), 2);
    let target = ids[1];
    let (tx, rx) = mpsc::channel();

    let scheduler = reactor.scheduler().clone();
    reactor.schedule(move || {
        scheduler.switch_to(Some(target));
        tx.send(filament::util::thread_id()).unwrap();
    });
    let landed_on = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(landed_on, target);

    reactor.stop();
}
