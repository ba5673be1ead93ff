//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "tests"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Dispatch ordering and readiness integration tests for the reactor."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::io::{ErrorKind, Read, Seek, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use printhost_rt::{Deadline, Reactor, SignalKind};

type Log = Vec<(&'static str, Instant)>;

fn record(name: &'static str, stop: bool) -> impl FnMut(&mut Log, &mut Reactor<Log>, Instant) -> Deadline {
    move |log: &mut Log, reactor: &mut Reactor<Log>, now: Instant| {
        log.push((name, now));
        if stop {
            reactor.stop();
        }
        Deadline::Never
    }
}

#[test]
fn timers_fire_in_deadline_order_with_registration_tiebreak() {
    let mut reactor: Reactor<Log> = Reactor::new().unwrap();
    let base = Instant::now() + Duration::from_millis(10);
    reactor.register_timer(record("stop", true), Deadline::At(base + Duration::from_millis(40)));
    reactor.register_timer(record("late", false), Deadline::At(base + Duration::from_millis(30)));
    reactor.register_timer(record("tie-a", false), Deadline::At(base + Duration::from_millis(20)));
    reactor.register_timer(record("early", false), Deadline::At(base));
    reactor.register_timer(record("tie-b", false), Deadline::At(base + Duration::from_millis(20)));
    reactor.register_timer(record("now", false), Deadline::Now);

    let mut log = Log::new();
    reactor.run(&mut log).unwrap();

    let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["now", "early", "tie-a", "tie-b", "late", "stop"]);
    assert!(log.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    assert!(log[1].1 >= base);
}

#[test]
fn equal_deadlines_that_are_already_due_keep_registration_order() {
    let mut reactor: Reactor<Log> = Reactor::new().unwrap();
    let past = Instant::now();
    reactor.register_timer(record("first", false), Deadline::At(past));
    reactor.register_timer(record("second", false), Deadline::At(past));
    reactor.register_timer(record("third", true), Deadline::At(past));

    let mut log = Log::new();
    reactor.run(&mut log).unwrap();
    let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["first", "second", "third"]);
}

#[test]
fn update_timer_reschedules_without_losing_identity() {
    let mut reactor: Reactor<Log> = Reactor::new().unwrap();
    let later = Instant::now() + Duration::from_millis(50);
    let slow = reactor.register_timer(record("slow", true), Deadline::At(later));
    reactor.register_timer(record("fast", false), Deadline::At(later - Duration::from_millis(40)));
    reactor.update_timer(slow, Deadline::Now).unwrap();

    let mut log = Log::new();
    reactor.run(&mut log).unwrap();
    let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["slow"]);
    assert_eq!(reactor.timer_deadline(slow), Some(Deadline::Never));
}

#[test]
fn return_value_becomes_the_next_deadline() {
    let mut reactor: Reactor<u32> = Reactor::new().unwrap();
    reactor.register_timer(
        |ticks: &mut u32, reactor: &mut Reactor<u32>, now| {
            *ticks += 1;
            if *ticks == 3 {
                reactor.stop();
                return Deadline::Never;
            }
            Deadline::At(now + Duration::from_millis(5))
        },
        Deadline::Now,
    );
    let mut ticks = 0;
    let started = Instant::now();
    reactor.run(&mut ticks).unwrap();
    assert_eq!(ticks, 3);
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(reactor.dispatch_stats().dispatched(), 3);
}

#[derive(Default)]
struct SelfRetiring {
    handle: Option<printhost_rt::TimerHandle>,
    fired: u32,
    spawned: bool,
}

#[test]
fn timer_can_unregister_itself_and_register_others() {
    let mut reactor: Reactor<SelfRetiring> = Reactor::new().unwrap();
    let handle = reactor.register_timer(
        |state: &mut SelfRetiring, reactor: &mut Reactor<SelfRetiring>, _| {
            state.fired += 1;
            if let Some(handle) = state.handle {
                assert!(reactor.unregister_timer(handle));
            }
            reactor.register_timer(
                |state: &mut SelfRetiring, reactor: &mut Reactor<SelfRetiring>, _| {
                    state.spawned = true;
                    reactor.stop();
                    Deadline::Never
                },
                Deadline::Now,
            );
            Deadline::Now
        },
        Deadline::Now,
    );
    let mut state = SelfRetiring {
        handle: Some(handle),
        ..SelfRetiring::default()
    };
    reactor.run(&mut state).unwrap();
    assert_eq!(state.fired, 1);
    assert!(state.spawned);
    assert_eq!(reactor.timer_deadline(handle), None);
}

struct Pipe {
    reader: UnixStream,
    writer: UnixStream,
    received: Vec<u8>,
}

#[test]
fn readable_descriptor_wakes_the_loop() {
    let (reader, writer) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    let mut pipe = Pipe {
        reader,
        writer,
        received: Vec::new(),
    };
    let mut reactor: Reactor<Pipe> = Reactor::new().unwrap();
    reactor
        .register_fd(&pipe.reader, |pipe: &mut Pipe, reactor: &mut Reactor<Pipe>, _| {
            let mut buf = [0u8; 64];
            loop {
                match pipe.reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => pipe.received.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => panic!("read failed: {err}"),
                }
            }
            if pipe.received.ends_with(b"\n") {
                reactor.stop();
            }
        })
        .unwrap();
    reactor.register_timer(
        |pipe: &mut Pipe, _: &mut Reactor<Pipe>, _| {
            pipe.writer.write_all(b"G28\n").unwrap();
            Deadline::Never
        },
        Deadline::At(Instant::now() + Duration::from_millis(20)),
    );
    reactor.run(&mut pipe).unwrap();
    assert_eq!(pipe.received, b"G28\n");
}

struct FileInput {
    file: std::fs::File,
    handle: Option<printhost_rt::FdHandle>,
    contents: String,
}

#[test]
fn regular_files_are_always_readable() {
    let mut tmp = tempfile::tempfile().unwrap();
    tmp.write_all(b"M105\n").unwrap();
    tmp.rewind().unwrap();

    let mut input = FileInput {
        file: tmp,
        handle: None,
        contents: String::new(),
    };
    let mut reactor: Reactor<FileInput> = Reactor::new().unwrap();
    let handle = reactor
        .register_fd(&input.file, |input: &mut FileInput, reactor: &mut Reactor<FileInput>, _| {
            let mut chunk = String::new();
            let read = input.file.read_to_string(&mut chunk).unwrap();
            input.contents.push_str(&chunk);
            if read == 0 {
                if let Some(handle) = input.handle.take() {
                    reactor.unregister_fd(handle);
                }
                reactor.stop();
            }
        })
        .unwrap();
    input.handle = Some(handle);
    reactor.run(&mut input).unwrap();
    assert_eq!(input.contents, "M105\n");
    assert!(input.handle.is_none());
}

#[test]
fn signals_are_dispatched_on_the_loop() {
    let mut reactor: Reactor<bool> = Reactor::new().unwrap();
    reactor
        .register_signal(SignalKind::user_defined1(), |seen: &mut bool, reactor: &mut Reactor<bool>, _| {
            *seen = true;
            reactor.stop();
        })
        .unwrap();
    reactor.register_timer(
        |_: &mut bool, _: &mut Reactor<bool>, _| {
            // SAFETY: raising a signal that has a handler installed above.
            unsafe {
                libc::raise(libc::SIGUSR1);
            }
            Deadline::Never
        },
        Deadline::Now,
    );
    let mut seen = false;
    reactor.run(&mut seen).unwrap();
    assert!(seen);
}

#[test]
fn signals_are_dispatched_while_a_file_is_always_readable() {
    let (done, finished) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let file = tempfile::tempfile().unwrap();
        let mut reactor: Reactor<bool> = Reactor::new().unwrap();
        reactor
            .register_signal(SignalKind::user_defined2(), |seen: &mut bool, reactor: &mut Reactor<bool>, _| {
                *seen = true;
                reactor.stop();
            })
            .unwrap();
        reactor
            .register_fd(&file, |_: &mut bool, _: &mut Reactor<bool>, _| {})
            .unwrap();
        reactor.register_timer(
            |_: &mut bool, _: &mut Reactor<bool>, _| {
                // SAFETY: raising a signal that has a handler installed above.
                unsafe {
                    libc::raise(libc::SIGUSR2);
                }
                Deadline::Never
            },
            Deadline::Now,
        );
        let mut seen = false;
        reactor.run(&mut seen).unwrap();
        let _ = done.send(seen);
    });
    let seen = finished
        .recv_timeout(Duration::from_secs(3))
        .expect("signal was never dispatched while the file stayed readable");
    assert!(seen);
}
