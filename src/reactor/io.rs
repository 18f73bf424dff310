use super::Descriptor;
use crate::error::{Error, Result};
use mio::{event::Source, Interest};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    ops::BitOr,
    time::Duration,
};

/// Readiness reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event(u8);

impl Event {
    const READABLE: u8 = 1;
    const WRITABLE: u8 = 2;
    const READ_CLOSED: u8 = 4;
    const WRITE_CLOSED: u8 = 8;

    pub fn readable() -> Self {
        Event(Self::READABLE)
    }
    pub fn writable() -> Self {
        Event(Self::WRITABLE)
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE != 0 || self.is_read_closed()
    }
    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE != 0 || self.is_write_closed()
    }
    pub fn is_read_closed(&self) -> bool {
        self.0 & Self::READ_CLOSED != 0
    }
    pub fn is_write_closed(&self) -> bool {
        self.0 & Self::WRITE_CLOSED != 0
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl From<&mio::event::Event> for Event {
    fn from(e: &mio::event::Event) -> Self {
        let mut event = 0;
        event |= e.is_readable() as u8;
        event |= (e.is_writable() as u8) << 1;
        // errors surface on the next read or write, so treat them as a hangup
        event |= ((e.is_read_closed() || e.is_error()) as u8) << 2;
        event |= ((e.is_write_closed() || e.is_error()) as u8) << 3;
        Event(event)
    }
}

/// The set of descriptors the server is currently watching.
///
/// Backed by a [`mio::Poll`]. Besides membership it tracks the highest
/// descriptor ever watched; that bound only grows, so it is always at least
/// as large as every member.
///
/// The set holds at most `capacity` descriptors. This is the same ceiling
/// `FD_SETSIZE` puts on `select(2)`, made explicit instead of silently
/// corrupting memory past it.
pub struct ReadinessSet {
    poll: mio::Poll,
    events: mio::Events,
    watched: BTreeSet<Descriptor>,
    max: Option<Descriptor>,
    capacity: usize,
}

impl ReadinessSet {
    pub fn new(event_capacity: usize, capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(event_capacity.max(1)),
            watched: BTreeSet::new(),
            max: None,
            capacity,
        })
    }

    /// The lowest descriptor value not currently watched.
    pub fn next_descriptor(&self) -> Descriptor {
        // members are sorted, so the first gap is the lowest free slot
        let mut next = 0;
        for d in &self.watched {
            if d.0 != next {
                break;
            }
            next += 1;
        }
        Descriptor(next)
    }

    /// Start watching `source` under `d`. Watching a member again does nothing.
    pub fn watch<S>(&mut self, d: Descriptor, source: &mut S, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        if self.watched.contains(&d) {
            return Ok(());
        }
        if self.watched.len() >= self.capacity {
            return Err(Error::Capacity { max: self.capacity });
        }

        self.poll.registry().register(source, d.into(), interest)?;
        self.watched.insert(d);
        if self.max.map_or(true, |max| d > max) {
            self.max = Some(d);
        }
        Ok(())
    }

    /// Change the interests of an already watched descriptor.
    pub fn rewatch<S>(&mut self, d: Descriptor, source: &mut S, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        debug_assert!(self.watched.contains(&d));
        self.poll.registry().reregister(source, d.into(), interest)?;
        Ok(())
    }

    /// Stop watching `d`.
    ///
    /// The descriptor leaves the set even if the OS refuses the
    /// deregistration. The tracked maximum is left alone.
    pub fn unwatch<S>(&mut self, d: Descriptor, source: &mut S)
    where
        S: Source + ?Sized,
    {
        if !self.watched.remove(&d) {
            return;
        }
        if let Err(e) = self.poll.registry().deregister(source) {
            tracing::warn!(descriptor = %d, cause = %e, "failed to deregister");
        }
    }

    /// Block until at least one watched descriptor is ready.
    ///
    /// Returns the ready members in ascending order, each once. `timeout`
    /// of `None` waits forever. An interrupted wait is retried.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(Descriptor, Event)>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::wait(e)),
            }
        }

        let mut ready = BTreeMap::<Descriptor, Event>::new();
        for event in &self.events {
            let d = Descriptor::from(event.token());
            // a source can still report after it was deregistered in this cycle
            if self.watched.contains(&d) {
                let entry = ready.entry(d).or_default();
                *entry = *entry | Event::from(event);
            }
        }
        Ok(ready.into_iter().collect())
    }

    pub fn contains(&self, d: Descriptor) -> bool {
        self.watched.contains(&d)
    }

    /// Watched descriptors in ascending order.
    pub fn watched(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.watched.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Upper bound on every descriptor in the set, `None` if nothing was ever watched.
    pub fn max_descriptor(&self) -> Option<Descriptor> {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::net::TcpStream;

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn watch_tracks_maximum() {
        let mut set = ReadinessSet::new(16, 16).unwrap();
        let (mut a, mut b) = (listener(), listener());

        set.watch(Descriptor(0), &mut a, Interest::READABLE).unwrap();
        set.watch(Descriptor(5), &mut b, Interest::READABLE).unwrap();
        assert_eq!(set.max_descriptor(), Some(Descriptor(5)));

        // the bound never shrinks
        set.unwatch(Descriptor(5), &mut b);
        assert_eq!(set.max_descriptor(), Some(Descriptor(5)));
        assert_eq!(set.watched().collect::<Vec<_>>(), vec![Descriptor(0)]);
    }

    #[test]
    fn watch_is_idempotent() {
        let mut set = ReadinessSet::new(16, 16).unwrap();
        let mut a = listener();
        set.watch(Descriptor(0), &mut a, Interest::READABLE).unwrap();
        set.watch(Descriptor(0), &mut a, Interest::READABLE).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn next_descriptor_fills_gaps() {
        let mut set = ReadinessSet::new(16, 16).unwrap();
        let mut sources: Vec<_> = (0..3).map(|_| listener()).collect();
        assert_eq!(set.next_descriptor(), Descriptor(0));
        for (i, source) in sources.iter_mut().enumerate() {
            set.watch(Descriptor(i), source, Interest::READABLE).unwrap();
        }
        assert_eq!(set.next_descriptor(), Descriptor(3));

        set.unwatch(Descriptor(1), &mut sources[1]);
        assert_eq!(set.next_descriptor(), Descriptor(1));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut set = ReadinessSet::new(16, 1).unwrap();
        let (mut a, mut b) = (listener(), listener());
        set.watch(Descriptor(0), &mut a, Interest::READABLE).unwrap();
        let err = set.watch(Descriptor(1), &mut b, Interest::READABLE).unwrap_err();
        assert!(matches!(err, Error::Capacity { max: 1 }));
        assert!(!set.contains(Descriptor(1)));
    }

    #[test]
    fn wait_reports_ready_listener() {
        let mut set = ReadinessSet::new(16, 16).unwrap();
        let mut a = listener();
        let addr = a.local_addr().unwrap();
        set.watch(Descriptor(0), &mut a, Interest::READABLE).unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        let ready = set.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, Descriptor(0));
        assert!(ready[0].1.is_readable());
    }

    #[test]
    fn unwatched_sources_are_not_reported() {
        let mut set = ReadinessSet::new(16, 16).unwrap();
        let mut a = listener();
        let addr = a.local_addr().unwrap();
        set.watch(Descriptor(0), &mut a, Interest::READABLE).unwrap();
        set.unwatch(Descriptor(0), &mut a);

        let _client = TcpStream::connect(addr).unwrap();
        let ready = set.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn event_bits() {
        let event = Event::readable() | Event::writable();
        assert!(event.is_readable());
        assert!(event.is_writable());
        assert!(!event.is_read_closed());
        assert!(!Event::default().is_readable());
    }
}
