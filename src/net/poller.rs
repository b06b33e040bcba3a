//! Readiness event loop wrapper.
//!
//! Thin, platform-uniform layer over the OS readiness facility (epoll on
//! Linux, kqueue on the BSDs, via mio). Exposes register/update/remove for
//! interest management and a blocking `wait`, plus a cross-thread waker so a
//! shutdown request issued from another thread can interrupt a blocked
//! `wait` deterministically.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the cross-thread waker. Ordinary registrations use
/// tokens handed out by the server, which never collide with this.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// A readiness notification: which registration fired, and how.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Wrapper owning the OS poll instance and the waker.
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Poller {
            poll,
            // Matches the dispatch batch size: at most this many
            // notifications are handled per wakeup.
            events: Events::with_capacity(64),
            waker,
        })
    }

    /// Register interest in readiness of `source` under `token`.
    pub fn add(&self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Replace the interest set of an already-registered `source`.
    ///
    /// Also used to re-arm an edge-triggered registration when a bounded
    /// batch stopped consuming before the source was drained.
    pub fn update(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Drop all interest in `source`.
    pub fn remove(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Handle for waking a blocked `wait` from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Block until at least one registered source is ready, the waker fires,
    /// or `timeout` elapses. Ready notifications are appended to `out`.
    ///
    /// An error here is fatal to the dispatch loop; there is no safe way to
    /// continue dispatching once the poll instance itself is broken.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        for event in self.events.iter() {
            out.push(Readiness {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_times_out_with_no_registrations() {
        let mut poller = Poller::new().unwrap();
        let mut ready = Vec::new();
        let start = Instant::now();
        poller
            .wait(Some(Duration::from_millis(20)), &mut ready)
            .unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn waker_interrupts_blocked_wait() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.wake().unwrap();
        });

        let mut ready = Vec::new();
        poller.wait(None, &mut ready).unwrap();
        handle.join().unwrap();

        assert!(ready.iter().any(|r| r.token == WAKER_TOKEN));
    }
}
