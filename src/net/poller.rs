// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Readiness multiplexing over registered sockets.
//!
//! `SPEC_FULL.md` §4.7 asks for a `(socket, requested_events)` registry
//! with `events(timeout) -> count` and `process_events(fn)`, built atop
//! `mio` since the teacher crate already carries it for this exact job
//! (`mio = { version = "1.0", features = ["net", "os-poll"] }`) rather
//! than a hand-rolled `epoll`/`poll(2)` wrapper.

use std::time::Duration;

pub use mio::event::Source;
pub use mio::{Interest, Token};

use crate::error::{Error, Result};

/// Which of the requested events fired for a given [`Token`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The peer's half (or both halves) closed.
    pub hup: bool,
}

/// A registry of readiness-polled sources. Tokens are assigned in
/// registration order and never reused within one `Poller`'s lifetime.
pub struct Poller {
    poll: mio::Poll,
    events: mio::Events,
    next_token: usize,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(capacity.max(4)),
            next_token: 0,
        })
    }

    /// Register `source` for `interest`, returning the freshly assigned
    /// token.
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        interest: Interest,
    ) -> Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(source, token, interest)?;
        Ok(token)
    }

    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Block up to `timeout` (`None` = forever) for at least one
    /// registered source to become ready, transparently restarting on
    /// `EINTR`. Returns the number of sources with non-empty readiness.
    pub fn events(&mut self, timeout: Option<Duration>) -> Result<usize> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => return Ok(self.events.iter().count()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Invoke `f` once per source whose readiness changed in the most
    /// recent [`Self::events`] call.
    pub fn process_events(&self, mut f: impl FnMut(Token, Readiness) -> Result<()>) -> Result<()> {
        for ev in self.events.iter() {
            let readiness = Readiness {
                readable: ev.is_readable(),
                writable: ev.is_writable(),
                hup: ev.is_read_closed() || ev.is_write_closed() || ev.is_error(),
            };
            f(ev.token(), readiness)?;
        }
        Ok(())
    }
}
