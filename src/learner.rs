//! The learner: collects DECIDE messages, stores them keyed by instance, and emits the decided
//! log to standard output in strict, contiguous, ascending instance order.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::io::{self, Write};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ident::Seq;
use crate::message::{CatchupRequest, Instance, Message};
use crate::net_node::NetNode;
use crate::shutdown::ShutdownFlag;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Default bound on how long the learner waits, with no DECIDE arriving, before it asks the
/// acceptors to fill a known gap.
pub const DEFAULT_CATCHUP_TIMEOUT: Duration = Duration::from_secs(2);

/// The pure learner state machine: the decided-value store and the ordered-emission rule, with
/// no socket or wall clock of its own.
pub struct LearnerCore<T> {
    learned: HashMap<Instance, T>,
    last_printed: Option<Instance>,
}

impl<T> LearnerCore<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        LearnerCore { learned: HashMap::new(), last_printed: None }
    }

    fn next_expected(&self) -> Instance {
        self.last_printed.map_or(0, |inst| inst + 1)
    }

    /// Section 4.3, `On DECIDE`. Returns `true` if this is the first time `inst` was recorded
    /// (duplicates, including duplicates arriving from different acceptors, are dropped here).
    pub fn on_decide(&mut self, inst: Instance, value: T) -> bool {
        if self.learned.contains_key(&inst) {
            return false;
        }
        self.learned.insert(inst, value);
        true
    }

    /// Merges a catch-up reply into the store. Returns the number of instances newly filled in.
    pub fn on_catchup_values(&mut self, entries: Vec<(Instance, Seq, T)>) -> usize {
        let mut newly_filled = 0;
        for (inst, _seq, value) in entries {
            if self.on_decide(inst, value) {
                newly_filled += 1;
            }
        }
        newly_filled
    }

    /// Section 4.3, emission rule: pops and returns every instance from `last_printed + 1`
    /// onward that is present contiguously, advancing `last_printed` as it goes.
    pub fn drain_emittable(&mut self) -> Vec<(Instance, T)> {
        let mut out = Vec::new();
        loop {
            let next = self.next_expected();
            match self.learned.remove(&next) {
                Some(value) => {
                    out.push((next, value));
                    self.last_printed = Some(next);
                }
                None => break,
            }
        }
        out
    }

    /// The gap positions between the next expected instance and the highest instance known to
    /// be decided, exclusive of that highest instance itself (which is, by definition, known).
    /// Empty if there is no known instance beyond the gap yet, i.e. nothing to catch up on.
    pub fn missing_instances(&self) -> Vec<Instance> {
        let next = self.next_expected();
        match self.learned.keys().max() {
            Some(&max_known) if max_known > next => {
                (next..max_known).filter(|i| !self.learned.contains_key(i)).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// The networked learner role: a [`LearnerCore`] plumbed to a multicast socket, with a catch-up
/// timer layered on top.
pub struct Learner<T> {
    id: u64,
    core: LearnerCore<T>,
    node: NetNode<T>,
    acceptors_address: SocketAddrV4,
    catchup_timeout: Duration,
    next_catchup_deadline: Instant,
}

impl<T> Learner<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug + Display,
{
    pub fn new(id: u64, learners_address: SocketAddrV4, acceptors_address: SocketAddrV4) -> Self {
        Self::with_catchup_timeout(id, learners_address, acceptors_address, DEFAULT_CATCHUP_TIMEOUT)
    }

    pub fn with_catchup_timeout(
        id: u64,
        learners_address: SocketAddrV4,
        acceptors_address: SocketAddrV4,
        catchup_timeout: Duration,
    ) -> Self {
        Learner {
            id,
            core: LearnerCore::new(),
            node: NetNode::new(&learners_address, POLL_TIMEOUT),
            acceptors_address,
            catchup_timeout,
            next_catchup_deadline: Instant::now() + catchup_timeout,
        }
    }

    fn emit(&mut self, values: Vec<(Instance, T)>) {
        if values.is_empty() {
            return;
        }
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        for (inst, value) in values {
            if log_enabled!(Level::Debug) {
                debug!("[L={}] emitting inst={} value={:?}", self.id, inst, value);
            }
            let _ = writeln!(lock, "{}", value);
            let _ = lock.flush();
        }
    }

    fn handle_decide(&mut self, inst: Instance, value: T) {
        if self.core.on_decide(inst, value) {
            self.next_catchup_deadline = Instant::now() + self.catchup_timeout;
            let emittable = self.core.drain_emittable();
            self.emit(emittable);
        }
    }

    fn handle_catchup_values(&mut self, entries: Vec<(Instance, Seq, T)>) {
        if self.core.on_catchup_values(entries) > 0 {
            self.next_catchup_deadline = Instant::now() + self.catchup_timeout;
            let emittable = self.core.drain_emittable();
            self.emit(emittable);
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if now < self.next_catchup_deadline {
            return;
        }
        self.next_catchup_deadline = now + self.catchup_timeout;

        let missing_inst = self.core.missing_instances();
        if missing_inst.is_empty() {
            return;
        }

        let request = CatchupRequest { missing_inst };
        if log_enabled!(Level::Info) {
            info!("[L={}] {:?}", self.id, request);
        }
        self.node.send(&Message::CatchupRequest(request), &self.acceptors_address);
    }

    pub fn run(&mut self, shutdown: &ShutdownFlag) {
        while !shutdown.requested() {
            match self.node.receive() {
                Some(Message::Phase3(d)) => self.handle_decide(d.inst, d.v_val),
                Some(Message::CatchupValues(v)) => self.handle_catchup_values(v.catchup_inst),
                Some(other) => {
                    debug!("[L={}] ignoring unexpected message {:?}", self.id, other);
                }
                None => {}
            }
            self.tick();
        }

        // Shutdown behavior (Section 4.3): flush whatever is already emittable; any remaining
        // non-contiguous tail is discarded, never emitted out of order.
        let emittable = self.core.drain_emittable();
        self.emit(emittable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_decides_emit_immediately() {
        let mut l = LearnerCore::<String>::new();
        l.on_decide(0, "A".to_owned());
        assert_eq!(l.drain_emittable(), vec![(0, "A".to_owned())]);
    }

    #[test]
    fn out_of_order_decide_is_buffered_until_the_gap_closes() {
        let mut l = LearnerCore::<String>::new();
        l.on_decide(1, "B".to_owned());
        assert!(l.drain_emittable().is_empty());

        l.on_decide(0, "A".to_owned());
        assert_eq!(
            l.drain_emittable(),
            vec![(0, "A".to_owned()), (1, "B".to_owned())]
        );
    }

    #[test]
    fn duplicate_decide_is_dropped() {
        let mut l = LearnerCore::<String>::new();
        assert!(l.on_decide(0, "A".to_owned()));
        assert!(!l.on_decide(0, "A".to_owned()));
        assert_eq!(l.drain_emittable(), vec![(0, "A".to_owned())]);
    }

    #[test]
    fn missing_instances_reports_the_interior_gap() {
        let mut l = LearnerCore::<String>::new();
        l.on_decide(2, "C".to_owned());
        assert_eq!(l.missing_instances(), vec![0, 1]);
    }

    #[test]
    fn no_gap_reported_with_nothing_known_beyond_the_next_expected() {
        let l = LearnerCore::<String>::new();
        assert!(l.missing_instances().is_empty());
    }

    #[test]
    fn catchup_values_close_the_gap_and_unblock_emission() {
        let mut l = LearnerCore::<String>::new();
        l.on_decide(2, "C".to_owned());
        assert!(l.drain_emittable().is_empty());

        let filled = l.on_catchup_values(vec![
            (0, Seq::new(1, 1), "A".to_owned()),
            (1, Seq::new(2, 1), "B".to_owned()),
        ]);
        assert_eq!(filled, 2);
        assert_eq!(
            l.drain_emittable(),
            vec![(0, "A".to_owned()), (1, "B".to_owned()), (2, "C".to_owned())]
        );
    }

    #[test]
    fn shutdown_discards_noncontiguous_tail() {
        let mut l = LearnerCore::<String>::new();
        l.on_decide(5, "F".to_owned());
        // Nothing is emittable: inst 0 never arrived, so the tail at 5 stays buffered forever,
        // and a caller that stops polling (shutdown) simply never emits it.
        assert!(l.drain_emittable().is_empty());
    }
}
