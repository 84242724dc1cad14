//! Node-level events: surfaced for anything that wants to react to or log
//! what the pipeline and lottery are doing without taking a hard dependency
//! on their internal types.

use std::net::SocketAddr;

use crate::pipeline::DropReason;

/// Something worth telling an observer about.
#[derive(Debug, Clone)]
pub enum Event {
    PacketForwarded { next_hop: SocketAddr },
    PacketDropped { reason: DropReason },
    LotteryDraw { relay: SocketAddr },
    ReputationUpdate { address: SocketAddr, delta: f64 },
}

/// Where [`Event`]s go. `NoopSink` for callers that don't care;
/// `InMemorySink` for tests and local inspection.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: Event) {}
}

/// Keeps the last `capacity` events in a ring buffer, useful for tests and
/// a debug `/events` endpoint.
pub struct InMemorySink {
    capacity: usize,
    events: std::sync::Mutex<std::collections::VecDeque<Event>>,
}

impl InMemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
        }
    }

    pub fn recent(&self) -> Vec<Event> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

impl EventSink for InMemorySink {
    fn emit(&self, event: Event) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_evicts_oldest_past_capacity() {
        let sink = InMemorySink::new(2);
        sink.emit(Event::PacketForwarded {
            next_hop: "127.0.0.1:1".parse().unwrap(),
        });
        sink.emit(Event::PacketForwarded {
            next_hop: "127.0.0.1:2".parse().unwrap(),
        });
        sink.emit(Event::PacketForwarded {
            next_hop: "127.0.0.1:3".parse().unwrap(),
        });

        let recent = sink.recent();
        assert_eq!(recent.len(), 2);
    }
}
