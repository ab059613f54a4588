// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words rcvr evpool

//! I/O task scenarios: accept + read over real TCP sockets, send tasks,
//! notify timeouts, datagram receive, and task stop/enable idempotence.

use evpool::{
    EvFlags, EvKind, IoBuf, IoTask, PoolConfig, SktOpts, SoFlags, TaskFlags, TaskFlow, ThreadPool,
};
use pretty_assertions::assert_eq;
use rustix::io::Errno;
use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    os::fd::RawFd,
    sync::mpsc,
    time::Duration,
};

fn pool_of(n: usize) -> ThreadPool {
    let pool = ThreadPool::new(PoolConfig { threads_max: n, bind_to_cpu: false }).unwrap();
    pool.spawn_threads(false).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    pool
}

fn local_addr_of(fd: RawFd) -> SocketAddr {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    assert_eq!(unsafe { libc::getsockname(fd, (&raw mut ss).cast(), &mut len) }, 0);
    let sin = unsafe { &*(&raw const ss).cast::<libc::sockaddr_in>() };
    SocketAddr::new(
        std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)).into(),
        u16::from_be(sin.sin_port),
    )
}

#[test]
fn accept_then_read_five_bytes() {
    let pool = pool_of(2);
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut opts = SktOpts::new(SoFlags::REUSEADDR, SoFlags::REUSEADDR);

    let (task_tx, task_rx) = mpsc::channel::<IoTask>();
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();

    let accept_task = IoTask::bind_accept(
        &pool.worker(0),
        &addr,
        libc::SOCK_STREAM,
        0,
        &mut opts,
        TaskFlags::CLOSE_ON_DESTROY,
        0,
        Box::new(move |ctx, err, conn| {
            assert_eq!(err, None);
            let Some((fd, peer)) = conn else { return TaskFlow::Continue };
            assert!(peer.is_some());
            // Hand the new socket to a receive task on this same worker.
            let data_tx = data_tx.clone();
            let conn_task = IoTask::sr(
                ctx.worker(),
                std::os::fd::IntoRawFd::into_raw_fd(fd) as u64,
                TaskFlags::CLOSE_ON_DESTROY,
            );
            conn_task
                .start(
                    EvKind::Read,
                    EvFlags::empty(),
                    5_000,
                    0,
                    Some(IoBuf::new(5)),
                    Box::new(move |ctx, err, eof, transferred| {
                        assert_eq!(err, None);
                        if transferred < 5 && eof.is_empty() {
                            return TaskFlow::Continue;
                        }
                        let buf = ctx.buf().expect("receive task keeps its buffer");
                        drop(data_tx.send(buf.as_slice().to_vec()));
                        ctx.stop();
                        TaskFlow::Done
                    }),
                )
                .unwrap();
            drop(task_tx.send(conn_task));
            TaskFlow::Continue
        }),
    )
    .unwrap();

    let server = local_addr_of(accept_task.ident() as RawFd);
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(server).unwrap();
        stream.write_all(b"hello").unwrap();
        std::thread::sleep(Duration::from_millis(300));
    });

    let _conn_task = task_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let data = data_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&data, b"hello");

    client.join().unwrap();
    drop(accept_task);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn send_task_writes_buffer_out() {
    let pool = pool_of(1);
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut opts = SktOpts::new(SoFlags::REUSEADDR, SoFlags::REUSEADDR);

    let (conn_tx, conn_rx) = mpsc::channel::<IoTask>();
    let accept_task = IoTask::bind_accept(
        &pool.worker(0),
        &addr,
        libc::SOCK_STREAM,
        0,
        &mut opts,
        TaskFlags::CLOSE_ON_DESTROY,
        0,
        Box::new(move |ctx, err, conn| {
            assert_eq!(err, None);
            let Some((fd, _peer)) = conn else { return TaskFlow::Continue };
            let task = IoTask::connect_send(
                ctx.worker(),
                std::os::fd::IntoRawFd::into_raw_fd(fd) as u64,
                TaskFlags::CLOSE_ON_DESTROY,
                2_000,
                IoBuf::from_vec(b"pong!".to_vec()),
                Box::new(|ctx, err, _eof, transferred| {
                    assert_eq!(err, None);
                    if transferred < 5 {
                        return TaskFlow::Continue;
                    }
                    ctx.stop();
                    TaskFlow::Done
                }),
            )
            .unwrap();
            drop(conn_tx.send(task));
            TaskFlow::Continue
        }),
    )
    .unwrap();

    let server = local_addr_of(accept_task.ident() as RawFd);
    let mut stream = TcpStream::connect(server).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let _conn_task = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut got = [0u8; 5];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"pong!");

    drop(accept_task);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn notify_reports_timeout() {
    let pool = pool_of(1);
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

    let (tx, rx) = mpsc::channel::<Option<Errno>>();
    // Nothing ever arrives on the pipe; the 100 ms timer must fire.
    let task = IoTask::notify(
        &pool.worker(0),
        fds[0] as u64,
        TaskFlags::empty(),
        EvKind::Read,
        100,
        Box::new(move |_ctx, err, _eof, _avail| {
            drop(tx.send(err));
            TaskFlow::Done
        }),
    )
    .unwrap();

    let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err, Some(Errno::TIMEDOUT));

    drop(task);
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn notify_fires_on_readiness() {
    let pool = pool_of(1);
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

    let (tx, rx) = mpsc::channel::<(Option<Errno>, u64)>();
    let task = IoTask::notify(
        &pool.worker(0),
        fds[0] as u64,
        TaskFlags::empty(),
        EvKind::Read,
        5_000,
        Box::new(move |ctx, err, _eof, avail| {
            drop(tx.send((err, avail)));
            ctx.stop();
            TaskFlow::Done
        }),
    )
    .unwrap();

    assert_eq!(unsafe { libc::write(fds[1], [1u8].as_ptr().cast(), 1) }, 1);
    let (err, avail) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err, None);
    assert!(avail >= 1);

    drop(task);
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn pkt_rcvr_delivers_each_datagram() {
    let pool = pool_of(1);
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server.local_addr().unwrap();
    server.set_nonblocking(true).unwrap();
    let fd = std::os::fd::IntoRawFd::into_raw_fd(server);

    let (tx, rx) = mpsc::channel::<(usize, Option<SocketAddr>)>();
    let task = IoTask::pkt_rcvr(
        &pool.worker(0),
        fd as u64,
        TaskFlags::CLOSE_ON_DESTROY,
        0,
        IoBuf::new(2048),
        Box::new(move |_ctx, err, peer, len| {
            assert_eq!(err, None);
            drop(tx.send((len, peer)));
            TaskFlow::Continue
        }),
    )
    .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"one", server_addr).unwrap();
    client.send_to(b"four", server_addr).unwrap();

    let (len_a, peer_a) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (len_b, peer_b) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(len_a + len_b, 7);
    assert_eq!(peer_a.unwrap(), client.local_addr().unwrap());
    assert_eq!(peer_b.unwrap(), client.local_addr().unwrap());

    drop(task);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn stop_is_idempotent_and_enable_round_trips() {
    let pool = pool_of(1);
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

    let (tx, rx) = mpsc::channel::<u8>();
    let task = IoTask::notify(
        &pool.worker(0),
        fds[0] as u64,
        TaskFlags::empty(),
        EvKind::Read,
        0,
        Box::new(move |_ctx, _err, _eof, _avail| {
            drop(tx.send(1));
            TaskFlow::Continue
        }),
    )
    .unwrap();

    // Disable, poke, nothing arrives; re-enable, delivery resumes.
    task.enable(false).unwrap();
    assert_eq!(unsafe { libc::write(fds[1], [1u8].as_ptr().cast(), 1) }, 1);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    task.enable(true).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

    // Stop twice: both harmless.
    task.stop();
    task.stop();
    // Restart from stored parameters still works.
    task.restart().unwrap();

    drop(task);
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    pool.shutdown();
    pool.shutdown_wait();
}
