//! Channels and select.
//!
//! Goroutines are host threads, so channels are built directly on
//! mutex + condvar. Each channel keeps a list of select wakers: a select
//! registers one waker on every involved channel, scans its cases, and
//! parks on the waker until any of those channels changes state.
//!
//! Unbuffered channels rendezvous through a one-slot hand-off: the sender
//! parks until its value has been taken, which preserves the
//! send-happens-before-receive-completion ordering.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::Panic;
use crate::value::Value;

/// Wakes a parked select when any registered channel changes state.
pub struct SelectWaker {
    signal: Mutex<bool>,
    cv: Condvar,
}

impl SelectWaker {
    fn new() -> Arc<SelectWaker> {
        Arc::new(SelectWaker { signal: Mutex::new(false), cv: Condvar::new() })
    }

    fn notify(&self) {
        let mut s = self.signal.lock();
        *s = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut s = self.signal.lock();
        while !*s {
            self.cv.wait(&mut s);
        }
        *s = false;
    }
}

struct ChanInner {
    buf: VecDeque<Value>,
    closed: bool,
    /// Receivers parked in `recv`.
    recv_wait: usize,
    /// Running count of values handed to receivers; unbuffered senders
    /// wait on this to learn their value was taken.
    taken: u64,
    /// Running count of values pushed.
    pushed: u64,
}

/// Shared channel state.
pub struct ChanCore {
    cap: usize,
    inner: Mutex<ChanInner>,
    cv: Condvar,
    wakers: Mutex<Vec<Weak<SelectWaker>>>,
}

/// Non-blocking send outcome, for select.
pub enum TrySend {
    Sent,
    NotReady,
    Closed,
}

/// Non-blocking receive outcome, for select.
pub enum TryRecv {
    Val(Value),
    Closed,
    NotReady,
}

impl ChanCore {
    pub fn new(cap: usize) -> Arc<ChanCore> {
        Arc::new(ChanCore {
            cap,
            inner: Mutex::new(ChanInner {
                buf: VecDeque::with_capacity(cap),
                closed: false,
                recv_wait: 0,
                taken: 0,
                pushed: 0,
            }),
            cv: Condvar::new(),
            wakers: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    fn notify_all(&self) {
        self.cv.notify_all();
        let mut wakers = self.wakers.lock();
        wakers.retain(|w| match w.upgrade() {
            Some(w) => {
                w.notify();
                true
            }
            None => false,
        });
    }

    fn add_waker(&self, w: &Arc<SelectWaker>) {
        self.wakers.lock().push(Arc::downgrade(w));
    }

    /// Blocking send.
    pub fn send(&self, v: Value) -> Result<(), Panic> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(Panic::runtime("send on closed channel"));
            }
            if self.cap > 0 {
                if inner.buf.len() < self.cap {
                    inner.buf.push_back(v);
                    inner.pushed += 1;
                    drop(inner);
                    self.notify_all();
                    return Ok(());
                }
            } else if inner.buf.is_empty() {
                inner.buf.push_back(v);
                inner.pushed += 1;
                let seq = inner.pushed;
                drop(inner);
                self.notify_all();
                // Rendezvous: wait until a receiver takes the value.
                let mut inner = self.inner.lock();
                while inner.taken < seq {
                    if inner.closed && !inner.buf.is_empty() {
                        return Err(Panic::runtime("send on closed channel"));
                    }
                    self.cv.wait(&mut inner);
                }
                return Ok(());
            }
            self.cv.wait(&mut inner);
        }
    }

    /// Blocking receive. `None` means the channel is closed and drained.
    pub fn recv(&self) -> Option<Value> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(v) = inner.buf.pop_front() {
                inner.taken += 1;
                drop(inner);
                self.notify_all();
                return Some(v);
            }
            if inner.closed {
                return None;
            }
            inner.recv_wait += 1;
            self.cv.wait(&mut inner);
            inner.recv_wait -= 1;
        }
    }

    pub fn close(&self) -> Result<(), Panic> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Panic::runtime("close of closed channel"));
            }
            inner.closed = true;
        }
        self.notify_all();
        Ok(())
    }

    /// Non-blocking send, used by select. An unbuffered send is ready only
    /// when a receiver is already parked.
    pub fn try_send(&self, v: Value) -> TrySend {
        let mut inner = self.inner.lock();
        if inner.closed {
            return TrySend::Closed;
        }
        let ready = if self.cap > 0 {
            inner.buf.len() < self.cap
        } else {
            inner.recv_wait > 0 && inner.buf.is_empty()
        };
        if !ready {
            return TrySend::NotReady;
        }
        inner.buf.push_back(v);
        inner.pushed += 1;
        drop(inner);
        self.notify_all();
        TrySend::Sent
    }

    /// Non-blocking receive, used by select.
    pub fn try_recv(&self) -> TryRecv {
        let mut inner = self.inner.lock();
        if let Some(v) = inner.buf.pop_front() {
            inner.taken += 1;
            drop(inner);
            self.notify_all();
            return TryRecv::Val(v);
        }
        if inner.closed {
            return TryRecv::Closed;
        }
        TryRecv::NotReady
    }
}

/// One select case, in declaration order. A `None` channel is a nil
/// channel: never ready.
pub enum SelectCase {
    Send { chan: Option<Arc<ChanCore>>, val: Value },
    Recv { chan: Option<Arc<ChanCore>> },
}

/// Outcome of a select: the chosen case index, the receive flag, and the
/// received value for a receive case.
pub struct SelectOutcome {
    pub chosen: usize,
    pub recv_ok: bool,
    pub recv_val: Option<Value>,
}

/// Run a select over `cases`. `None` means the default branch was taken;
/// only possible when `blocking` is false.
pub fn run_select(cases: &[SelectCase], blocking: bool) -> Result<Option<SelectOutcome>, Panic> {
    let waker = SelectWaker::new();
    let mut registered = false;

    loop {
        for (i, case) in cases.iter().enumerate() {
            match case {
                SelectCase::Send { chan: Some(ch), val } => match ch.try_send(val.clone()) {
                    TrySend::Sent => {
                        return Ok(Some(SelectOutcome { chosen: i, recv_ok: false, recv_val: None }))
                    }
                    TrySend::Closed => return Err(Panic::runtime("send on closed channel")),
                    TrySend::NotReady => {}
                },
                SelectCase::Recv { chan: Some(ch) } => match ch.try_recv() {
                    TryRecv::Val(v) => {
                        return Ok(Some(SelectOutcome {
                            chosen: i,
                            recv_ok: true,
                            recv_val: Some(v),
                        }))
                    }
                    TryRecv::Closed => {
                        return Ok(Some(SelectOutcome { chosen: i, recv_ok: false, recv_val: None }))
                    }
                    TryRecv::NotReady => {}
                },
                // Nil channel cases never become ready.
                _ => {}
            }
        }
        if !blocking {
            return Ok(None);
        }
        if !registered {
            for case in cases {
                match case {
                    SelectCase::Send { chan: Some(ch), .. }
                    | SelectCase::Recv { chan: Some(ch) } => ch.add_waker(&waker),
                    _ => {}
                }
            }
            registered = true;
            // Re-scan once after registration to close the race between
            // the first scan and parking.
            continue;
        }
        waker.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_buffered_send_recv() {
        let ch = ChanCore::new(2);
        ch.send(Value::Int(1)).unwrap();
        ch.send(Value::Int(2)).unwrap();
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.recv(), Some(Value::Int(1)));
        assert_eq!(ch.recv(), Some(Value::Int(2)));
    }

    #[test]
    fn test_close_drains_then_reports() {
        let ch = ChanCore::new(4);
        ch.send(Value::Int(7)).unwrap();
        ch.close().unwrap();
        assert_eq!(ch.recv(), Some(Value::Int(7)));
        assert_eq!(ch.recv(), None);
        assert!(ch.close().is_err());
        assert!(ch.send(Value::Int(8)).is_err());
    }

    #[test]
    fn test_unbuffered_rendezvous() {
        let ch = ChanCore::new(0);
        let ch2 = ch.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ch2.recv()
        });
        ch.send(Value::Int(42)).unwrap();
        assert_eq!(t.join().unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn test_select_default() {
        let ch = ChanCore::new(1);
        let cases = [SelectCase::Recv { chan: Some(ch.clone()) }];
        let got = run_select(&cases, false).unwrap();
        assert!(got.is_none());

        ch.send(Value::Int(5)).unwrap();
        let got = run_select(&cases, false).unwrap().unwrap();
        assert_eq!(got.chosen, 0);
        assert!(got.recv_ok);
        assert_eq!(got.recv_val, Some(Value::Int(5)));
    }

    #[test]
    fn test_select_blocks_until_ready() {
        let ch = ChanCore::new(1);
        let ch2 = ch.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ch2.send(Value::Int(9)).unwrap();
        });
        let cases = [SelectCase::Recv { chan: Some(ch.clone()) }];
        let got = run_select(&cases, true).unwrap().unwrap();
        assert_eq!(got.chosen, 0);
        assert_eq!(got.recv_val, Some(Value::Int(9)));
        t.join().unwrap();
    }

    #[test]
    fn test_select_nil_channel_never_ready() {
        let got = run_select(&[SelectCase::Recv { chan: None }], false).unwrap();
        assert!(got.is_none());
    }
}
