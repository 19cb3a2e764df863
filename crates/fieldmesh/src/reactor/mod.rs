// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-adapter event loop: timers, I/O readiness and wake callbacks
//! multiplexed on one dedicated thread.
//!
//! Every adapter owns exactly one reactor. Callbacks run serially on the
//! reactor thread, so adapter state touched only from callbacks needs no
//! further synchronization. Cross-thread registration goes through a
//! command channel drained between callbacks; a `mio::Waker` interrupts
//! the poll when a command or mailbox notification arrives.
//!
//! # Timer semantics
//!
//! - `NonBlock`: re-triggers on the nominal schedule regardless of
//!   callback cost; missed ticks collapse into one.
//! - `Block`: disarmed across the callback and re-armed on the original
//!   schedule afterwards. An overdue tick fires immediately after the
//!   callback completes; ticks never overlap or pile up.
//!
//! # Cancellation
//!
//! `del_timer`/`del_io` are race-free: the id is tombstoned before the
//! removal command is queued, and a cross-thread caller blocks until the
//! loop acknowledges, which it can only do between callbacks. After the
//! call returns, no callback for that registration begins.

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Hard bound on registered events (timers + I/O sources + wake hooks)
/// per reactor. Exceeding it is a fatal misconfiguration.
pub const REACTOR_EVENT_MAX: usize = 1400;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Scheduling class of a timer; chosen by the plugin descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    NonBlock,
    Block,
}

/// Readiness classes delivered to an I/O callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoReadiness {
    Readable,
    Hup,
    Closed,
}

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// Handle to a registered I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoId(u64);

type TimerCallback = Box<dyn FnMut() + Send>;
type IoCallback = Box<dyn FnMut(IoReadiness) + Send>;
type WakeCallback = Box<dyn FnMut() + Send>;

enum Command {
    AddTimer {
        id: u64,
        interval: Duration,
        kind: TimerKind,
        cb: TimerCallback,
    },
    DelTimer {
        id: u64,
        done: Option<Sender<()>>,
    },
    AddIo {
        id: u64,
        fd: RawFd,
        cb: IoCallback,
    },
    DelIo {
        id: u64,
        done: Option<Sender<()>>,
    },
    AddWake {
        id: u64,
        cb: WakeCallback,
    },
    Close,
}

/// Cheap cross-thread notifier that interrupts a reactor's poll. Bus
/// senders hold one per destination mailbox.
#[derive(Clone)]
pub struct ReactorNotifier {
    waker: Arc<Waker>,
    alive: Arc<AtomicBool>,
}

impl ReactorNotifier {
    /// Wake the reactor if it is still running.
    pub fn wake(&self) {
        if self.alive.load(Ordering::Acquire) {
            let _ = self.waker.wake();
        }
    }
}

/// Cloneable registration handle; safe to use from any thread, including
/// reactor callbacks themselves.
#[derive(Clone)]
pub struct ReactorHandle {
    name: Arc<String>,
    cmd_tx: Sender<Command>,
    notifier: ReactorNotifier,
    next_id: Arc<AtomicU64>,
    registered: Arc<AtomicUsize>,
    tombstones: Arc<Mutex<HashSet<u64>>>,
    loop_thread: ThreadId,
}

impl ReactorHandle {
    fn alloc(&self) -> u64 {
        let used = self.registered.fetch_add(1, Ordering::Relaxed);
        assert!(
            used < REACTOR_EVENT_MAX,
            "reactor {}: event table exhausted ({} events)",
            self.name,
            REACTOR_EVENT_MAX
        );
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a periodic timer. The first tick fires one interval from
    /// now.
    pub fn add_timer(
        &self,
        interval: Duration,
        kind: TimerKind,
        cb: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let id = self.alloc();
        let cmd = Command::AddTimer {
            id,
            interval,
            kind,
            cb,
        };
        if self.cmd_tx.send(cmd).is_err() {
            tracing::warn!("reactor {}: add_timer on closed reactor", self.name);
        }
        self.notifier.wake();
        TimerId(id)
    }

    /// Remove a timer. When called from outside the reactor thread this
    /// blocks until any in-flight callback has completed; afterwards no
    /// callback for the timer begins.
    pub fn del_timer(&self, id: TimerId) {
        self.del(id.0, true);
    }

    /// Register an I/O source for readiness callbacks.
    pub fn add_io(&self, fd: RawFd, cb: Box<dyn FnMut(IoReadiness) + Send>) -> IoId {
        let id = self.alloc();
        if self.cmd_tx.send(Command::AddIo { id, fd, cb }).is_err() {
            tracing::warn!("reactor {}: add_io on closed reactor", self.name);
        }
        self.notifier.wake();
        IoId(id)
    }

    /// Remove an I/O source with the same guarantee as [`del_timer`].
    ///
    /// [`del_timer`]: ReactorHandle::del_timer
    pub fn del_io(&self, id: IoId) {
        self.del(id.0, false);
    }

    /// Register a callback run whenever the reactor is woken; used to
    /// drain the adapter's mailbox. Lives until the reactor closes.
    pub fn add_wake(&self, cb: Box<dyn FnMut() + Send>) {
        let id = self.alloc();
        if self.cmd_tx.send(Command::AddWake { id, cb }).is_err() {
            tracing::warn!("reactor {}: add_wake on closed reactor", self.name);
        }
        self.notifier.wake();
    }

    /// Notifier for this reactor, held by bus senders.
    pub fn notifier(&self) -> ReactorNotifier {
        self.notifier.clone()
    }

    fn del(&self, id: u64, is_timer: bool) {
        self.tombstones.lock().insert(id);
        let same_thread = thread::current().id() == self.loop_thread;
        let (done_tx, done_rx) = if same_thread {
            (None, None)
        } else {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        };
        let cmd = if is_timer {
            Command::DelTimer { id, done: done_tx }
        } else {
            Command::DelIo { id, done: done_tx }
        };
        if self.cmd_tx.send(cmd).is_ok() {
            self.notifier.wake();
            if let Some(rx) = done_rx {
                let _ = rx.recv_timeout(Duration::from_secs(5));
            }
        }
        self.registered.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One single-threaded event loop; owner side.
pub struct Reactor {
    handle: ReactorHandle,
    join: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Spawn the loop thread.
    pub fn spawn(name: &str) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let alive = Arc::new(AtomicBool::new(true));
        let tombstones = Arc::new(Mutex::new(HashSet::new()));
        let (cmd_tx, cmd_rx) = unbounded();

        let mut state = LoopState {
            poll,
            cmd_rx,
            tombstones: Arc::clone(&tombstones),
            timers: HashMap::new(),
            heap: BinaryHeap::new(),
            ios: HashMap::new(),
            wakes: Vec::new(),
        };
        let thread_name = format!("fm-reactor-{}", name);
        let join = thread::Builder::new()
            .name(thread_name)
            .spawn(move || state.run())?;

        let handle = ReactorHandle {
            name: Arc::new(name.to_string()),
            cmd_tx,
            notifier: ReactorNotifier { waker, alive },
            next_id: Arc::new(AtomicU64::new(0)),
            registered: Arc::new(AtomicUsize::new(0)),
            tombstones,
            loop_thread: join.thread().id(),
        };
        Ok(Reactor {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Stop the loop and join the thread. Idempotent.
    pub fn close(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handle.cmd_tx.send(Command::Close);
            let _ = self.handle.notifier.waker.wake();
            let _ = join.join();
            self.handle.notifier.alive.store(false, Ordering::Release);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

struct TimerState {
    interval: Duration,
    kind: TimerKind,
    cb: TimerCallback,
}

struct IoState {
    fd: RawFd,
    cb: IoCallback,
}

struct LoopState {
    poll: Poll,
    cmd_rx: Receiver<Command>,
    tombstones: Arc<Mutex<HashSet<u64>>>,
    timers: HashMap<u64, TimerState>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    ios: HashMap<u64, IoState>,
    wakes: Vec<WakeCallback>,
}

impl LoopState {
    fn run(&mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if !self.drain_commands() {
                break;
            }
            self.fire_due_timers();

            let timeout = self
                .heap
                .peek()
                .map(|Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("reactor poll failed: {}", e);
                    break;
                }
            }

            let mut woken = false;
            let mut io_hits: Vec<(u64, IoReadiness)> = Vec::new();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    woken = true;
                    continue;
                }
                let id = event.token().0 as u64;
                let readiness = if event.is_readable() {
                    IoReadiness::Readable
                } else if event.is_read_closed() || event.is_write_closed() {
                    IoReadiness::Hup
                } else if event.is_error() {
                    IoReadiness::Closed
                } else {
                    continue;
                };
                io_hits.push((id, readiness));
            }
            for (id, readiness) in io_hits {
                if self.tombstones.lock().contains(&id) {
                    continue;
                }
                if let Some(io) = self.ios.get_mut(&id) {
                    (io.cb)(readiness);
                }
            }
            if woken {
                for cb in &mut self.wakes {
                    cb();
                }
            }
        }
        // Deregister remaining sources before the poll is dropped.
        for io in self.ios.values() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&io.fd));
        }
    }

    /// Apply queued commands. Returns `false` on `Close`.
    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::AddTimer {
                    id,
                    interval,
                    kind,
                    cb,
                } => {
                    self.timers.insert(id, TimerState { interval, kind, cb });
                    self.heap.push(Reverse((Instant::now() + interval, id)));
                }
                Command::DelTimer { id, done } => {
                    self.timers.remove(&id);
                    self.tombstones.lock().remove(&id);
                    if let Some(tx) = done {
                        let _ = tx.send(());
                    }
                }
                Command::AddIo { id, fd, cb } => {
                    let res = self.poll.registry().register(
                        &mut SourceFd(&fd),
                        Token(id as usize),
                        Interest::READABLE,
                    );
                    match res {
                        Ok(()) => {
                            self.ios.insert(id, IoState { fd, cb });
                        }
                        Err(e) => {
                            tracing::warn!("reactor: io registration failed: {}", e);
                        }
                    }
                }
                Command::DelIo { id, done } => {
                    if let Some(io) = self.ios.remove(&id) {
                        let _ = self.poll.registry().deregister(&mut SourceFd(&io.fd));
                    }
                    self.tombstones.lock().remove(&id);
                    if let Some(tx) = done {
                        let _ = tx.send(());
                    }
                }
                Command::AddWake { id: _, cb } => {
                    self.wakes.push(cb);
                }
                Command::Close => return false,
            }
        }
        true
    }

    /// Fire every timer whose deadline has passed, each at most once per
    /// pass so commands and I/O stay responsive under overload.
    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due: Vec<(Instant, u64)> = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            due.push((deadline, id));
        }

        for (deadline, id) in due {
            if !self.timers.contains_key(&id) || self.tombstones.lock().contains(&id) {
                continue;
            }
            let kind = self.timers[&id].kind;
            match kind {
                TimerKind::NonBlock => {
                    // Re-arm on the nominal schedule before running the
                    // callback; missed ticks collapse.
                    let interval = self.timers[&id].interval;
                    let mut next = deadline + interval;
                    let after = Instant::now();
                    while next <= after {
                        next += interval;
                    }
                    self.heap.push(Reverse((next, id)));
                    if let Some(timer) = self.timers.get_mut(&id) {
                        (timer.cb)();
                    }
                }
                TimerKind::Block => {
                    if let Some(timer) = self.timers.get_mut(&id) {
                        (timer.cb)();
                    }
                    // The callback may have removed its own timer.
                    if !self.timers.contains_key(&id) || self.tombstones.lock().contains(&id) {
                        continue;
                    }
                    let interval = self.timers[&id].interval;
                    let after = Instant::now();
                    let next = (deadline + interval).max(after);
                    self.heap.push(Reverse((next, id)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_nonblock_timer_ticks() {
        let mut reactor = Reactor::spawn("t-nonblock").unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        reactor.handle().add_timer(
            Duration::from_millis(10),
            TimerKind::NonBlock,
            Box::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        );
        thread::sleep(Duration::from_millis(100));
        reactor.close();
        let n = hits.load(Ordering::Relaxed);
        assert!(n >= 3, "expected several ticks, got {}", n);
    }

    #[test]
    fn test_block_timer_never_overlaps() {
        let mut reactor = Reactor::spawn("t-block").unwrap();
        let inflight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let hits = Arc::new(AtomicU32::new(0));
        let (inf, max, h) = (
            Arc::clone(&inflight),
            Arc::clone(&max_seen),
            Arc::clone(&hits),
        );
        reactor.handle().add_timer(
            Duration::from_millis(5),
            TimerKind::Block,
            Box::new(move || {
                let cur = inf.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(cur, Ordering::SeqCst);
                // Callback slower than the interval.
                thread::sleep(Duration::from_millis(15));
                h.fetch_add(1, Ordering::SeqCst);
                inf.fetch_sub(1, Ordering::SeqCst);
            }),
        );
        thread::sleep(Duration::from_millis(120));
        reactor.close();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "callbacks overlapped");
        // Overdue ticks fire immediately after completion, so we still
        // get several rounds despite the slow callback.
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_del_timer_blocks_out_future_callbacks() {
        let mut reactor = Reactor::spawn("t-del").unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let id = reactor.handle().add_timer(
            Duration::from_millis(5),
            TimerKind::NonBlock,
            Box::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        );
        thread::sleep(Duration::from_millis(30));
        reactor.handle().del_timer(id);
        let frozen = hits.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::Relaxed), frozen);
        reactor.close();
    }

    #[test]
    fn test_del_timer_from_inside_callback() {
        let mut reactor = Reactor::spawn("t-selfdel").unwrap();
        let handle = reactor.handle();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let id = handle.clone().add_timer(
            Duration::from_millis(20),
            TimerKind::NonBlock,
            Box::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
                if let Some(id) = *slot2.lock() {
                    handle.del_timer(id);
                }
            }),
        );
        *slot.lock() = Some(id);
        thread::sleep(Duration::from_millis(60));
        reactor.close();
        assert_eq!(hits.load(Ordering::Relaxed), 1, "timer must stop itself");
    }

    #[test]
    fn test_wake_callback_runs_on_notify() {
        let mut reactor = Reactor::spawn("t-wake").unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        reactor.handle().add_wake(Box::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        }));
        thread::sleep(Duration::from_millis(10));
        let notifier = reactor.handle().notifier();
        notifier.wake();
        thread::sleep(Duration::from_millis(20));
        assert!(hits.load(Ordering::Relaxed) >= 1);
        reactor.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut reactor = Reactor::spawn("t-close").unwrap();
        reactor.close();
        reactor.close();
    }

    #[test]
    fn test_io_readable_callback() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut reactor = Reactor::spawn("t-io").unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let id = reactor.handle().add_io(
            rx.as_raw_fd(),
            Box::new(move |readiness| {
                if readiness == IoReadiness::Readable {
                    h.fetch_add(1, Ordering::Relaxed);
                }
            }),
        );
        thread::sleep(Duration::from_millis(20));
        tx.write_all(b"ping").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(hits.load(Ordering::Relaxed) >= 1, "readable not delivered");

        reactor.handle().del_io(id);
        tx.write_all(b"pong").unwrap();
        let frozen = hits.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::Relaxed), frozen);
        reactor.close();
        drop(rx);
    }
}
