//! ev::API End-to-End Smoke Test
//!
//! Exercises the whole provider/consumer contract:
//!   Part A: Publish & bind: lookup before publish, version checks, two consumers
//!   Part B: Marshalling helpers through the table
//!   Part C: Watchers: io, timer, periodic, signal, child, stat, idle/prepare/check
//!   Part D: Loop control: once, pending, break, ref/unref
//!
//! Run: ./target/release/ev-smoke
//! Set EV_LOG_LEVEL=debug to see provider/registry logging.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use evapi::{
    i_ev_api, ApiVersion, BindError, BreakHow, Check, CheckWatcher, Child, ChildWatcher, Ev,
    EvSlot, HostHandle, Idle, IdleWatcher, Io, IoWatcher, Periodic, PeriodicWatcher, Prepare,
    PrepareWatcher, Publish, Registry, Revents, RunFlags, Signal, SignalSpec, SignalWatcher,
    Stat, StatWatcher, Timer, TimerWatcher, API_NAME,
};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

static EV: EvSlot = EvSlot::new();

/// Break every run after `secs` so one stuck watcher cannot hang the binary.
fn watchdog(ev: Ev, secs: f64) -> TimerWatcher {
    let w = TimerWatcher::new(Timer::new(secs, 0.0), move |_, _| ev.break_loop(BreakHow::All));
    ev.timer_start(&w);
    ev.unref_loop();
    w
}

/// Undo the watchdog's unref whether or not it fired.
fn disarm(ev: Ev, w: &TimerWatcher) {
    ev.ref_loop();
    ev.timer_stop(w);
}

// ════════════════════════════════════════════════════════════
// Part A: Publish & bind
// ════════════════════════════════════════════════════════════

fn test_publish_bind(t: &mut TestRunner) -> Option<Ev> {
    t.section("Part A: Publish & bind");

    // A1: private registry, nothing published yet
    let reg = Registry::new();
    match Ev::bind_in(&reg, "early-plugin") {
        Err(BindError::NotFound { name }) => t.check("bind before publish -> NotFound", name == API_NAME, &name),
        other => t.fail("bind before publish -> NotFound", &format!("{:?}", other.map(|e| e.api_version()))),
    }

    // A2: publish twice
    let first = evloop_runtime::publish_in(&reg);
    t.check("publish", first == Ok(Publish::Published), &format!("{:?}", first));
    let again = evloop_runtime::publish_in(&reg);
    t.check("republish is a no-op", again == Ok(Publish::Unchanged), &format!("{:?}", again));

    // A3: consumer built for a newer revision
    match evapi::import_with(&reg, ApiVersion::new(3, 1), "future-plugin") {
        Err(e @ BindError::VersionMismatch { .. }) => {
            let msg = e.to_string();
            t.check("3.0 provider refuses 3.1 consumer", msg.contains("3.0 vs. 3.1"), &msg);
        }
        other => t.fail("3.0 provider refuses 3.1 consumer", &format!("{:?}", other.is_ok())),
    }

    // A4: other major version
    let old = evapi::import_with(&reg, ApiVersion::new(2, 0), "old-plugin");
    t.check("version 2 consumer refused", old.is_err(), "bound");

    // A5: global registry via the macro and a slot
    if let Err(e) = evloop_runtime::publish() {
        t.fail("publish global", &e.to_string());
        return None;
    }
    t.pass("publish global");
    let a = match i_ev_api!(EV, "smoke-a") {
        Ok(ev) => { t.pass("i_ev_api! (slot)"); ev }
        Err(e) => { t.fail("i_ev_api! (slot)", &e.to_string()); return None; }
    };
    let b = i_ev_api!("smoke-b");
    t.check(
        "two consumers share the table",
        b.as_ref().is_ok_and(|b| b.same_table(&a)),
        "different tables",
    );
    t.check("slot caches handle", EV.get().is_some_and(|e| e.same_table(&a)), "empty slot");
    t.check("backend is poll", a.backend() == evapi::backend::POLL, &format!("{:#x}", a.backend()));
    Some(a)
}

// ════════════════════════════════════════════════════════════
// Part B: Marshalling
// ════════════════════════════════════════════════════════════

fn test_marshalling(t: &mut TestRunner, ev: Ev) {
    t.section("Part B: Marshalling");

    let (s, _peer) = match UnixStream::pair() {
        Ok(p) => p,
        Err(e) => { t.fail("socketpair", &e.to_string()); return; }
    };
    t.check("sv_fileno(object)", ev.sv_fileno(&HostHandle::Object(&s)) == Some(s.as_raw_fd()), "wrong fd");
    t.check("sv_fileno(\"3\")", ev.sv_fileno(&HostHandle::Str("3")) == Some(3), "not 3");
    t.check("sv_fileno(-2) rejected", ev.sv_fileno(&HostHandle::Fd(-2)).is_none(), "accepted");
    t.check("sv_signum(\"int\")", ev.sv_signum(&SignalSpec::Name("int")) == Some(libc::SIGINT), "not SIGINT");
    t.check("sv_signum(\"SIGUSR1\")", ev.sv_signum(&SignalSpec::Name("SIGUSR1")) == Some(libc::SIGUSR1), "not SIGUSR1");
    t.check("sv_signum(\"bogus\") rejected", ev.sv_signum(&SignalSpec::Name("bogus")).is_none(), "accepted");
    t.check("sv_signum(0) rejected", ev.sv_signum(&SignalSpec::Num(0)).is_none(), "accepted");
}

// ════════════════════════════════════════════════════════════
// Part C: Watchers
// ════════════════════════════════════════════════════════════

fn test_watchers(t: &mut TestRunner, ev: Ev) {
    t.section("Part C: Watchers");

    // C1: one-shot timer
    let fired = Rc::new(Cell::new(0));
    let f = Rc::clone(&fired);
    let timer = TimerWatcher::new(Timer::new(0.01, 0.0), move |_, _| f.set(f.get() + 1));
    ev.timer_start(&timer);
    ev.run(RunFlags::DEFAULT);
    t.check("timer fires once", fired.get() == 1 && !timer.is_active(), &format!("fired {}", fired.get()));

    // C2: repeating timer stopped from its own callback
    let ticks = Rc::new(Cell::new(0));
    let tk = Rc::clone(&ticks);
    let repeat = TimerWatcher::new(Timer::new(0.0, 0.005), move |w, _| {
        tk.set(tk.get() + 1);
        if tk.get() == 3 {
            ev.timer_stop(w);
        }
    });
    ev.timer_start(&repeat);
    let dog = watchdog(ev, 2.0);
    ev.run(RunFlags::DEFAULT);
    disarm(ev, &dog);
    t.check("repeat timer stops itself", ticks.get() == 3, &format!("ticks {}", ticks.get()));

    // C3: io readable
    match UnixStream::pair() {
        Ok((a, mut b)) => {
            let seen = Rc::new(Cell::new(Revents::NONE));
            let s = Rc::clone(&seen);
            let io = IoWatcher::new(Io::new(a.as_raw_fd(), Revents::READ), move |w, revents| {
                s.set(revents);
                ev.io_stop(w);
            });
            ev.io_start(&io);
            let _ = b.write_all(b"ping");
            let dog = watchdog(ev, 2.0);
            ev.run(RunFlags::DEFAULT);
            disarm(ev, &dog);
            t.check("io readable", seen.get() == Revents::READ, &format!("{:?}", seen.get()));
        }
        Err(e) => t.fail("io readable", &e.to_string()),
    }

    // C4: periodic
    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    let periodic = PeriodicWatcher::new(Periodic::new(0.0, 0.02), move |w, _| {
        h.set(h.get() + 1);
        if h.get() == 2 {
            ev.periodic_stop(w);
        }
    });
    ev.periodic_start(&periodic);
    let dog = watchdog(ev, 2.0);
    ev.run(RunFlags::DEFAULT);
    disarm(ev, &dog);
    t.check("periodic fires twice", hits.get() == 2, &format!("hits {}", hits.get()));

    // C5: signal
    let caught = Rc::new(Cell::new(false));
    let c = Rc::clone(&caught);
    let sig = SignalWatcher::new(Signal::new(libc::SIGUSR1), move |w, _| {
        c.set(true);
        ev.signal_stop(w);
    });
    ev.signal_start(&sig);
    let raised = nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1);
    let dog = watchdog(ev, 2.0);
    ev.run(RunFlags::DEFAULT);
    disarm(ev, &dog);
    t.check("signal SIGUSR1", raised.is_ok() && caught.get(), "not delivered");

    // C6: child
    match std::process::Command::new("sh").args(["-c", "exit 5"]).spawn() {
        Ok(child) => {
            let pid = child.id() as i32;
            let code = Rc::new(Cell::new(None));
            let cd = Rc::clone(&code);
            let cw = ChildWatcher::new(Child::new(pid, false), move |w, _| {
                cd.set(w.params().exit_code());
                ev.child_stop(w);
            });
            ev.child_start(&cw);
            let dog = watchdog(ev, 5.0);
            ev.run(RunFlags::DEFAULT);
            disarm(ev, &dog);
            t.check("child exit status", code.get() == Some(5), &format!("{:?}", code.get()));
        }
        Err(e) => t.fail("child exit status", &e.to_string()),
    }

    // C7: stat
    let path = std::env::temp_dir().join(format!("ev-smoke-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let changed = Rc::new(Cell::new(false));
    let ch = Rc::clone(&changed);
    let stat = StatWatcher::new(Stat::new(&path, 0.1), move |w, _| {
        ch.set(w.params().attr.exists);
        ev.stat_stop(w);
    });
    ev.stat_start(&stat);
    let p = path.clone();
    let writer = TimerWatcher::new(Timer::new(0.02, 0.0), move |_, _| {
        let _ = std::fs::write(&p, b"smoke");
    });
    ev.timer_start(&writer);
    let dog = watchdog(ev, 3.0);
    ev.run(RunFlags::DEFAULT);
    disarm(ev, &dog);
    t.check("stat sees file appear", changed.get(), "no change seen");
    let _ = std::fs::write(&path, b"smoke, longer");
    ev.stat_stat(&stat);
    t.check(
        "stat_stat refreshes attr",
        stat.params().attr.size == 13 && stat.params().prev.size == 5,
        &format!("{} / {}", stat.params().attr.size, stat.params().prev.size),
    );
    let _ = std::fs::remove_file(&path);

    // C8: prepare / check / idle ordering
    let order = Rc::new(RefCell::new(Vec::new()));
    let o = Rc::clone(&order);
    let prep = PrepareWatcher::new(Prepare, move |_, _| o.borrow_mut().push("prepare"));
    let o = Rc::clone(&order);
    let chk = CheckWatcher::new(Check, move |_, _| o.borrow_mut().push("check"));
    let o = Rc::clone(&order);
    let idle = IdleWatcher::new(Idle, move |_, _| o.borrow_mut().push("idle"));
    ev.prepare_start(&prep);
    ev.check_start(&chk);
    ev.idle_start(&idle);
    ev.run(RunFlags::NOWAIT);
    ev.prepare_stop(&prep);
    ev.check_stop(&chk);
    ev.idle_stop(&idle);
    let got = order.borrow().clone();
    t.check("prepare, check, idle dispatched", got.len() == 3 && got[0] == "prepare", &format!("{:?}", got));
}

// ════════════════════════════════════════════════════════════
// Part D: Loop control
// ════════════════════════════════════════════════════════════

fn test_loop_control(t: &mut TestRunner, ev: Ev) {
    t.section("Part D: Loop control");

    // D1: once with timeout only
    let got = Rc::new(Cell::new(Revents::NONE));
    let g = Rc::clone(&got);
    let start = ev.time();
    ev.once(-1, Revents::NONE, 0.05, move |revents| g.set(revents));
    ev.run(RunFlags::DEFAULT);
    let waited = ev.time() - start;
    t.check("once timeout -> TIMER", got.get() == Revents::TIMER, &format!("{:?}", got.get()));
    t.check("once waited ~50ms", waited >= 0.04, &format!("{:.3}s", waited));

    // D2: once on a ready fd
    match UnixStream::pair() {
        Ok((a, mut b)) => {
            let _ = b.write_all(b"x");
            let got = Rc::new(Cell::new(Revents::NONE));
            let g = Rc::clone(&got);
            ev.once(a.as_raw_fd(), Revents::READ, 5.0, move |revents| g.set(revents));
            ev.run(RunFlags::DEFAULT);
            t.check("once io -> READ", got.get() == Revents::READ, &format!("{:?}", got.get()));
        }
        Err(e) => t.fail("once io -> READ", &e.to_string()),
    }

    // D3: clear_pending / invoke
    let seen = Rc::new(Cell::new(Revents::NONE));
    let s = Rc::clone(&seen);
    let w = IdleWatcher::new(Idle, move |_, revents| s.set(revents));
    t.check("clear_pending on idle watcher", ev.clear_pending(&w).is_empty(), "had events");
    ev.invoke(&w, Revents::CUSTOM);
    t.check("invoke runs callback now", seen.get() == Revents::CUSTOM, &format!("{:?}", seen.get()));

    // D4: start/stop/stop
    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    let quiet = TimerWatcher::new(Timer::new(0.0, 0.0), move |_, _| h.set(h.get() + 1));
    ev.timer_start(&quiet);
    ev.timer_stop(&quiet);
    ev.timer_stop(&quiet);
    ev.run(RunFlags::NOWAIT);
    t.check("stopped watcher never fires", hits.get() == 0, "fired");

    // D5: unref lets run return with a long timer pending
    let long = TimerWatcher::new(Timer::new(60.0, 0.0), |_, _| {});
    ev.timer_start(&long);
    ev.unref_loop();
    let start = ev.time();
    ev.run(RunFlags::DEFAULT);
    let took = ev.time() - start;
    ev.ref_loop();
    ev.timer_stop(&long);
    t.check("unref'd watcher does not keep run alive", took < 1.0, &format!("{:.3}s", took));

    // D6: break
    let keep = TimerWatcher::new(Timer::new(60.0, 0.0), |_, _| {});
    ev.timer_start(&keep);
    let stopper = TimerWatcher::new(Timer::new(0.01, 0.0), move |_, _| ev.break_loop(BreakHow::One));
    ev.timer_start(&stopper);
    ev.run(RunFlags::DEFAULT);
    t.check("break_loop(One) returns from run", keep.is_active(), "keepalive gone");
    ev.timer_stop(&keep);

    let now = ev.now();
    t.check("now() is wall-clock seconds", now > 1_577_836_800.0, &format!("{}", now));
}

fn main() {
    println!("=== ev::API End-to-End Smoke Test ===");
    println!("    api: {}.{}", evapi::API_VERSION, evapi::API_REVISION);

    let mut t = TestRunner::new();

    let ev = match test_publish_bind(&mut t) {
        Some(ev) => ev,
        None => {
            println!("\nFATAL: could not bind ev::API");
            t.summary();
            std::process::exit(1);
        }
    };

    test_marshalling(&mut t, ev);
    test_watchers(&mut t, ev);
    test_loop_control(&mut t, ev);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
