//! The proposer: assigns instance numbers to client values, drives Phase 1/Phase 2 to a
//! majority, and re-drives any instance whose decision hasn't come back within a randomized
//! timeout.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use log::Level;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ident::{Round, Seq};
use crate::message::{AcceptRequest, ClientValue, Decide, Instance, Message, Preparation, Promise};
use crate::net_node::NetNode;
use crate::shutdown::ShutdownFlag;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Default bounds for the repropose timer (Section 9, Open Question 3): a uniformly random
/// interval between 1 and 3 seconds.
pub const DEFAULT_REPROPOSE_RANGE: (Duration, Duration) =
    (Duration::from_secs(1), Duration::from_secs(3));

/// A proposer's bookkeeping for one in-flight instance.
struct InstanceState<T> {
    c_rnd: Round,
    c_val: T,
    seq: Seq,
    promise_count: usize,
    best_v_rnd: Option<Round>,
    best_v_val: Option<T>,
    accept_sent: bool,
}

/// The pure proposer state machine: instance/round bookkeeping and the quorum-driven phase
/// advance, with no socket or wall clock of its own. [`Proposer`] adds the timing and networking
/// shell around this.
pub struct ProposerCore<T> {
    self_id: u64,
    next_counter: u64,
    next_inst: Instance,
    quorum: usize,
    states: HashMap<Instance, InstanceState<T>>,
    seq_to_inst: HashMap<Seq, Instance>,
    pending_value: HashMap<Seq, T>,
    open_instances: BTreeSet<Instance>,
    learned: HashSet<Instance>,
}

impl<T> ProposerCore<T>
where
    T: Clone + Debug,
{
    /// `quorum` must be the configured acceptor group's cardinality, halved-and-rounded-up
    /// (Section 4.2, Open Question 1) — never a literal.
    pub fn new(self_id: u64, quorum: usize) -> Self {
        ProposerCore {
            self_id,
            next_counter: 1,
            next_inst: 0,
            quorum,
            states: HashMap::new(),
            seq_to_inst: HashMap::new(),
            pending_value: HashMap::new(),
            open_instances: BTreeSet::new(),
            learned: HashSet::new(),
        }
    }

    fn fresh_round(&mut self) -> Round {
        let r = Round::new(self.next_counter, self.self_id);
        self.next_counter += 1;
        r
    }

    /// Section 4.2, `On CLIENT-VALUE`: always allocates a brand new instance.
    pub fn start(&mut self, value: T, seq: Seq) -> (Instance, Preparation) {
        let inst = self.next_inst;
        self.next_inst += 1;
        self.open_instances.insert(inst);
        self.pending_value.insert(seq, value.clone());
        self.seq_to_inst.insert(seq, inst);

        let c_rnd = self.fresh_round();
        self.states.insert(
            inst,
            InstanceState {
                c_rnd,
                c_val: value,
                seq,
                promise_count: 0,
                best_v_rnd: None,
                best_v_val: None,
                accept_sent: false,
            },
        );

        (inst, Preparation { inst, c_rnd, seq })
    }

    /// Section 4.2, `On PROMISE`. Returns the ACCEPT-REQUEST to send once a quorum of promises
    /// for the current round has been seen; `None` otherwise, including for stale or duplicate
    /// promises (round mismatch, or quorum already reached once for this round).
    pub fn on_promise(&mut self, promise: Promise<T>) -> Option<AcceptRequest<T>> {
        let state = self.states.get_mut(&promise.inst)?;
        if promise.rnd != state.c_rnd {
            return None;
        }

        state.promise_count += 1;
        if let Some(v_rnd) = promise.v_rnd {
            if state.best_v_rnd.map_or(true, |best| v_rnd > best) {
                state.best_v_rnd = Some(v_rnd);
                state.best_v_val = promise.v_val;
            }
        }

        if state.accept_sent || state.promise_count < self.quorum {
            return None;
        }
        state.accept_sent = true;

        if let Some(best_val) = state.best_v_val.clone() {
            state.c_val = best_val;
        }

        Some(AcceptRequest {
            inst: promise.inst,
            seq: promise.seq,
            c_rnd: state.c_rnd,
            c_val: state.c_val.clone(),
        })
    }

    /// Section 4.2, `On DECIDE`. Returns `true` the first time this instance is learned (callers
    /// use that to retire their own retry timer for `decide.seq`); `false` on a duplicate.
    pub fn on_decide(&mut self, decide: &Decide<T>) -> bool {
        if !self.learned.insert(decide.inst) {
            return false;
        }
        self.open_instances.remove(&decide.inst);
        self.pending_value.remove(&decide.seq);
        self.seq_to_inst.remove(&decide.seq);
        self.states.remove(&decide.inst);
        true
    }

    /// Section 4.2, repropose: reuses the instance this `seq` is currently attached to if it's
    /// still open, otherwise allocates a new one. Returns `None` if `seq` is no longer pending
    /// (it was decided, or never existed).
    pub fn repropose(&mut self, seq: Seq) -> Option<(Instance, Preparation)> {
        let value = self.pending_value.get(&seq)?.clone();

        let inst = match self.seq_to_inst.get(&seq) {
            Some(&inst) if self.open_instances.contains(&inst) => inst,
            _ => {
                let inst = self.next_inst;
                self.next_inst += 1;
                self.open_instances.insert(inst);
                inst
            }
        };
        self.seq_to_inst.insert(seq, inst);

        let c_rnd = self.fresh_round();
        self.states.insert(
            inst,
            InstanceState {
                c_rnd,
                c_val: value,
                seq,
                promise_count: 0,
                best_v_rnd: None,
                best_v_val: None,
                accept_sent: false,
            },
        );

        Some((inst, Preparation { inst, c_rnd, seq }))
    }

    /// True once `inst` has a recorded decision (used by tests and by the networked wrapper to
    /// decide whether a pending seq still needs a retry timer).
    pub fn is_learned(&self, inst: Instance) -> bool {
        self.learned.contains(&inst)
    }
}

/// The networked proposer role: a [`ProposerCore`] plumbed to a multicast socket, with a
/// randomized per-seq retry timer layered on top.
pub struct Proposer<T> {
    id: u64,
    core: ProposerCore<T>,
    node: NetNode<T>,
    acceptors_address: SocketAddrV4,
    retry_deadline: HashMap<Seq, Instant>,
    repropose_range: (Duration, Duration),
}

impl<T> Proposer<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug,
{
    /// `_learners_address` is accepted for symmetry with the other roles' constructors (the
    /// binary entrypoint wires up all three group addresses uniformly) even though this role
    /// never sends to the learner group itself.
    pub fn new(
        id: u64,
        proposers_address: SocketAddrV4,
        acceptors_address: SocketAddrV4,
        _learners_address: SocketAddrV4,
        num_of_acceptors: usize,
    ) -> Self {
        Self::with_repropose_range(
            id,
            proposers_address,
            acceptors_address,
            num_of_acceptors,
            DEFAULT_REPROPOSE_RANGE,
        )
    }

    pub fn with_repropose_range(
        id: u64,
        proposers_address: SocketAddrV4,
        acceptors_address: SocketAddrV4,
        num_of_acceptors: usize,
        repropose_range: (Duration, Duration),
    ) -> Self {
        Proposer {
            id,
            core: ProposerCore::new(id, num_of_acceptors / 2 + 1),
            node: NetNode::new(&proposers_address, POLL_TIMEOUT),
            acceptors_address,
            retry_deadline: HashMap::new(),
            repropose_range,
        }
    }

    fn random_retry_duration(&self) -> Duration {
        let (min, max) = self.repropose_range;
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        if max_ms <= min_ms {
            min
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(min_ms, max_ms))
        }
    }

    fn handle_client_value(&mut self, cv: ClientValue<T>) {
        let seq = Seq::new(cv.prop_id, cv.client_id);
        let (_inst, prep) = self.core.start(cv.value, seq);
        self.retry_deadline.insert(seq, Instant::now() + self.random_retry_duration());

        if log_enabled!(Level::Info) {
            info!("[P={}] {:?}", self.id, prep);
        }
        self.node.send(&Message::Phase1a(prep), &self.acceptors_address);
    }

    fn handle_promise(&mut self, promise: Promise<T>) {
        if let Some(accept) = self.core.on_promise(promise) {
            if log_enabled!(Level::Info) {
                info!("[P={}] {:?}", self.id, accept);
            }
            self.node.send(&Message::Phase2a(accept), &self.acceptors_address);
        }
    }

    fn handle_decide(&mut self, decide: Decide<T>) {
        if self.core.on_decide(&decide) {
            self.retry_deadline.remove(&decide.seq);
            if log_enabled!(Level::Info) {
                info!("[P={}] learned {:?}", self.id, decide);
            }
        }
    }

    /// Redrives every pending seq whose retry timer has elapsed. Run once per event loop
    /// iteration, independent of whether that iteration's receive produced a message.
    fn tick(&mut self) {
        let now = Instant::now();
        let due: Vec<Seq> = self
            .retry_deadline
            .iter()
            .filter(|&(_, &deadline)| now >= deadline)
            .map(|(&seq, _)| seq)
            .collect();

        for seq in due {
            match self.core.repropose(seq) {
                Some((_inst, prep)) => {
                    if log_enabled!(Level::Info) {
                        info!("[P={}] reproposing {:?}", self.id, prep);
                    }
                    self.node.send(&Message::Phase1a(prep), &self.acceptors_address);
                    self.retry_deadline.insert(seq, now + self.random_retry_duration());
                }
                None => {
                    self.retry_deadline.remove(&seq);
                }
            }
        }
    }

    pub fn run(&mut self, shutdown: &ShutdownFlag) {
        while !shutdown.requested() {
            match self.node.receive() {
                Some(Message::ClientValue(cv)) => self.handle_client_value(cv),
                Some(Message::Phase1b(p)) => self.handle_promise(p),
                Some(Message::Phase3(d)) => self.handle_decide(d),
                Some(other) => {
                    debug!("[P={}] ignoring unexpected message {:?}", self.id, other);
                }
                None => {}
            }
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promise(inst: Instance, seq: Seq, rnd: Round, v_rnd: Option<Round>, v_val: Option<&str>) -> Promise<String> {
        Promise { inst, seq, rnd, v_rnd, v_val: v_val.map(str::to_owned) }
    }

    #[test]
    fn start_assigns_ascending_instances() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let (inst0, _) = p.start("A".to_owned(), Seq::new(1, 1));
        let (inst1, _) = p.start("B".to_owned(), Seq::new(2, 1));
        assert_eq!(inst0, 0);
        assert_eq!(inst1, 1);
    }

    #[test]
    fn successive_rounds_from_one_proposer_strictly_increase() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let (_, prep0) = p.start("A".to_owned(), Seq::new(1, 1));
        let (_, prep1) = p.start("B".to_owned(), Seq::new(2, 1));
        assert!(prep1.c_rnd.counter() > prep0.c_rnd.counter());
    }

    #[test]
    fn quorum_of_promises_triggers_accept_request() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let seq = Seq::new(1, 1);
        let (inst, prep) = p.start("A".to_owned(), seq);

        assert!(p.on_promise(promise(inst, seq, prep.c_rnd, None, None)).is_none());
        let accept = p.on_promise(promise(inst, seq, prep.c_rnd, None, None)).unwrap();
        assert_eq!(accept.c_val, "A");
    }

    #[test]
    fn stale_round_promise_is_ignored() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let seq = Seq::new(1, 1);
        let (inst, _) = p.start("A".to_owned(), seq);
        let stale = Round::new(0, 99);
        assert!(p.on_promise(promise(inst, seq, stale, None, None)).is_none());
    }

    #[test]
    fn pick_rule_adopts_highest_previously_accepted_value() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let seq = Seq::new(1, 1);
        let (inst, prep) = p.start("A".to_owned(), seq);

        p.on_promise(promise(inst, seq, prep.c_rnd, Some(Round::new(1, 9)), Some("B")));
        let accept = p
            .on_promise(promise(inst, seq, prep.c_rnd, Some(Round::new(2, 9)), Some("C")))
            .unwrap();
        // Highest v_rnd seen is (2, 9) -> its value "C" wins, not the proposer's own "A".
        assert_eq!(accept.c_val, "C");
    }

    #[test]
    fn decide_retires_instance_and_is_idempotent() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let seq = Seq::new(1, 1);
        let (inst, _) = p.start("A".to_owned(), seq);
        let decide = Decide { inst, seq, v_rnd: Round::new(1, 1), v_val: "A".to_owned() };

        assert!(p.on_decide(&decide));
        assert!(p.is_learned(inst));
        assert!(!p.on_decide(&decide));
    }

    #[test]
    fn repropose_reuses_still_open_instance() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let seq = Seq::new(1, 1);
        let (inst, _) = p.start("A".to_owned(), seq);
        let (retry_inst, retry_prep) = p.repropose(seq).unwrap();
        assert_eq!(retry_inst, inst);
        assert_eq!(retry_prep.seq, seq);
    }

    #[test]
    fn repropose_after_decision_allocates_a_new_instance() {
        let mut p = ProposerCore::<String>::new(1, 2);
        let seq_a = Seq::new(1, 1);
        let (inst_a, _) = p.start("A".to_owned(), seq_a);
        p.on_decide(&Decide { inst: inst_a, seq: seq_a, v_rnd: Round::new(1, 1), v_val: "A".to_owned() });

        let seq_b = Seq::new(2, 1);
        let (inst_b, _) = p.start("B".to_owned(), seq_b);
        // inst_a is now closed from this proposer's perspective; B's own instance should not be
        // confused with it and should still be reproposable in place.
        let (retry_inst, _) = p.repropose(seq_b).unwrap();
        assert_eq!(retry_inst, inst_b);
        assert_ne!(inst_a, inst_b);
    }

    #[test]
    fn repropose_of_unknown_seq_is_none() {
        let mut p = ProposerCore::<String>::new(1, 2);
        assert!(p.repropose(Seq::new(42, 1)).is_none());
    }
}
