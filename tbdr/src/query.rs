//! Occlusion query pools and events.
use crate::{
    device::Device,
    memory::{Bo, DevAddr, Heap},
    queue::SyncPoint,
    Result,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Maximum number of queries in a pool. Query indices are 14-bit visibility registers.
pub const MAX_QUERIES: u32 = 1 << 14;

/// An occlusion query pool.
///
/// Each query has one result counter (written by the ISP visibility test) and one availability
/// word (written by the availability kernel once the fragment work is done).
#[derive(Debug)]
pub struct QueryPool {
    query_count: u32,
    results: Bo,
    availability: Bo,
}

impl QueryPool {
    pub fn new(device: &Arc<Device>, query_count: u32) -> Result<Arc<QueryPool>> {
        debug_assert!(query_count > 0 && query_count <= MAX_QUERIES);
        let size = query_count as u64 * 4;
        Ok(Arc::new(QueryPool {
            query_count,
            results: device.alloc(Heap::VisTest, size, 64)?,
            availability: device.alloc(Heap::General, size, 64)?,
        }))
    }

    pub fn query_count(&self) -> u32 {
        self.query_count
    }

    pub fn results_addr(&self) -> DevAddr {
        self.results.addr()
    }

    pub fn availability_addr(&self) -> DevAddr {
        self.availability.addr()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventStatus {
    Reset,
    Set,
}

#[derive(Debug)]
struct EventState {
    status: EventStatus,
    /// Signalled when the device operation that last changed the status is done. `None` when the
    /// status was last changed from the host.
    sync: Option<SyncPoint>,
}

/// A synchronization event, signalled and waited on by event sub-commands.
#[derive(Debug)]
pub struct Event {
    word: Bo,
    state: Mutex<EventState>,
}

impl Event {
    pub fn new(device: &Arc<Device>) -> Result<Arc<Event>> {
        let word = device.alloc(Heap::General, 4, 4)?;
        word.write(0, &[0]);
        Ok(Arc::new(Event {
            word,
            state: Mutex::new(EventState {
                status: EventStatus::Reset,
                sync: None,
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the event's state word.
    pub fn addr(&self) -> DevAddr {
        self.word.addr()
    }

    pub fn status(&self) -> EventStatus {
        self.lock().status
    }

    /// Sets the event from the host.
    pub fn set(&self) {
        self.update(EventStatus::Set, None);
    }

    /// Resets the event from the host.
    pub fn reset(&self) {
        self.update(EventStatus::Reset, None);
    }

    /// Sync point a device-side wait on this event must wait for.
    pub(crate) fn sync(&self) -> Option<SyncPoint> {
        self.lock().sync
    }

    pub(crate) fn update(&self, status: EventStatus, sync: Option<SyncPoint>) {
        let mut state = self.lock();
        state.status = status;
        state.sync = sync;
        self.word.write(0, &[(status == EventStatus::Set) as u32]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn host_set_and_reset() {
        let device = testing::device();
        let event = Event::new(&device).unwrap();
        assert_eq!(event.status(), EventStatus::Reset);
        event.set();
        assert_eq!(event.status(), EventStatus::Set);
        assert_eq!(event.sync(), None);
        event.update(EventStatus::Reset, Some(SyncPoint(7)));
        assert_eq!(event.status(), EventStatus::Reset);
        assert_eq!(event.sync(), Some(SyncPoint(7)));
    }
}
