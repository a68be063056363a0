//! Hooked-syscall scenarios: sleeping fibers, connect timeouts, blocking
//! reads resolved by close, and a full echo round-trip.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libc::{c_int, c_void};

use filament::config::Config;
use filament::fd::FdRegistry;
use filament::fiber;
use filament::hook;
use filament::reactor::IoReactor;

fn socketpair() -> (c_int, c_int) {
    let mut fds = [0 as c_int; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn sleeping_fibers_share_one_worker() {
    let reactor = IoReactor::new(1, false, "sleep-concurrency").unwrap();
    // Let the worker reach its epoll wait so the first schedule is
    // picked up through a tickle, not a 5s wait expiry.
    std::thread::sleep(Duration::from_millis(100));
    let order = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    let order_s2 = order.clone();
    reactor.schedule(move || {
        fiber::sleep(Duration::from_millis(2000));
        order_s2.lock().unwrap().push("s2");
    });
    let order_s3 = order.clone();
    reactor.schedule(move || {
        fiber::sleep(Duration::from_millis(3000));
        order_s3.lock().unwrap().push("s3");
    });
    reactor.stop();

    // Both sleeps overlap on the single worker: total is bounded by the
    // longer one, not the sum.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3500), "elapsed {:?}", elapsed);
    assert_eq!(*order.lock().unwrap(), vec!["s2", "s3"]);
}

#[test]
fn connect_times_out_against_blackhole() {
    let timeout = Config::lookup::<i64>("tcp.connect.timeout", 5000, "tcp connect timeout");
    timeout.set(100);

    let reactor = IoReactor::new(1, false, "connect-timeout").unwrap();
    let (tx, rx) = mpsc::channel();

    reactor.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // Routable but non-answering address: the SYN goes nowhere.
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 81u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([10, 255, 255, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let started = Instant::now();
        let rc = unsafe {
            hook::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let err = std::io::Error::last_os_error();
        let still_open = unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1;
        tx.send((rc, err, started.elapsed(), still_open)).unwrap();
        hook::close(fd);
    });

    let (rc, err, elapsed, still_open) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    reactor.stop();
    timeout.set(5000);

    assert_eq!(rc, -1);
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => {
            assert!(elapsed >= Duration::from_millis(90), "elapsed {:?}", elapsed);
            assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
            assert!(still_open);
        }
        // Sandboxes without egress report unreachability instead of
        // swallowing the SYN; the timeout path cannot be observed there.
        Some(libc::ENETUNREACH) | Some(libc::EACCES) | Some(libc::ECONNREFUSED)
        | Some(libc::EHOSTUNREACH) => {
            eprintln!("skipping timeout assertions: connect failed with {}", err);
        }
        other => panic!("unexpected connect errno {:?} ({})", other, err),
    }
}

#[test]
fn close_unblocks_reader() {
    // One worker serializes the closer behind the reader, so the close is
    // complete by the time the reader's retry runs.
    let reactor = IoReactor::new(1, false, "close-wakes").unwrap();
    let (fd_read, fd_peer) = socketpair();
    FdRegistry::instance().get(fd_read, true);
    FdRegistry::instance().get(fd_peer, true);
    let (tx, rx) = mpsc::channel();

    reactor.schedule(move || {
        let mut buf = [0u8; 8];
        // No data and no timeout: only close() can end this read.
        let n = unsafe { hook::read(fd_read, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        let err = std::io::Error::last_os_error();
        tx.send((n, err)).unwrap();
    });

    {
        reactor.schedule(move || {
            fiber::sleep(Duration::from_millis(200));
            hook::close(fd_read);
        });
    }

    let (n, err) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    // EOF or a bad-descriptor error are both acceptable; hanging is not.
    assert!(
        n == 0 || (n == -1 && err.raw_os_error() == Some(libc::EBADF)),
        "read returned {} ({})",
        n,
        err
    );

    reactor.stop();
    unsafe { libc::close(fd_peer) };
}

#[test]
fn zero_timeout_read_probes_once() {
    let reactor = IoReactor::new(1, false, "zero-timeout").unwrap();
    let (fd_read, fd_peer) = socketpair();
    FdRegistry::instance().get(fd_read, true);
    let (tx, rx) = mpsc::channel();

    reactor.schedule(move || {
        let tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        unsafe {
            hook::setsockopt(
                fd_read,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );
        }
        let started = Instant::now();
        let mut buf = [0u8; 8];
        let n = unsafe { hook::read(fd_read, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        let err = std::io::Error::last_os_error();
        tx.send((n, err, started.elapsed())).unwrap();
    });

    let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    // One probe, no reactor wait.
    assert!(elapsed < Duration::from_millis(100), "elapsed {:?}", elapsed);

    reactor.stop();
    unsafe {
        libc::close(fd_read);
        libc::close(fd_peer);
    }
    FdRegistry::instance().del(fd_read);
}

#[test]
fn echo_round_trip_through_the_shim() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let reactor = IoReactor::new(1, false, "echo").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            hook::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let payload = b"hello";
        let sent = unsafe { hook::send(fd, payload.as_ptr() as *const c_void, payload.len(), 0) };
        assert_eq!(sent, 5);

        // The reply is not there yet: this read suspends the fiber until
        // the server echoes.
        let mut buf = [0u8; 5];
        let got = unsafe { hook::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(got, 5);
        assert_eq!(&buf, payload);
        hook::close(fd);
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    reactor.stop();
    server.join().unwrap();
}
