//! Per-instance Paxos acceptor: tracks the highest promised round, the last accepted round and
//! value, and the first decision observed, for every instance it has seen a message for.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddrV4;
use std::time::Duration;

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ident::{Round, Seq};
use crate::message::{
    AcceptRequest, CatchupRequest, CatchupValues, Decide, Instance, Message, Preparation, Promise,
};
use crate::net_node::NetNode;
use crate::shutdown::ShutdownFlag;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// One instance's durable-within-process state. Acceptors are volatile (Section 9, Open
/// Question 5): there is nothing here that survives a process restart, by design.
struct AcceptorState<T> {
    rnd: Round,
    v_rnd: Option<Round>,
    v_val: Option<T>,
    decision: Option<(Seq, T)>,
}

impl<T> AcceptorState<T> {
    fn new(self_id: u64) -> Self {
        AcceptorState {
            rnd: Round::new(0, self_id),
            v_rnd: None,
            v_val: None,
            decision: None,
        }
    }
}

/// The pure acceptor state machine, with no socket of its own — every operation takes a message
/// in and returns the (at most one distinct) message the protocol requires in response. Kept
/// separate from [`Acceptor`] so the Paxos logic can be unit tested without a multicast group.
pub struct AcceptorCore<T> {
    self_id: u64,
    states: HashMap<Instance, AcceptorState<T>>,
}

impl<T> AcceptorCore<T>
where
    T: Clone + Debug,
{
    pub fn new(self_id: u64) -> Self {
        AcceptorCore { self_id, states: HashMap::new() }
    }

    fn state_for(&mut self, inst: Instance) -> &mut AcceptorState<T> {
        let self_id = self.self_id;
        self.states.entry(inst).or_insert_with(|| AcceptorState::new(self_id))
    }

    /// Section 4.1, `On PREPARE`.
    pub fn on_preparation(&mut self, p: Preparation) -> Option<Promise<T>> {
        let state = self.state_for(p.inst);
        if p.c_rnd > state.rnd {
            state.rnd = p.c_rnd;
            Some(Promise {
                inst: p.inst,
                seq: p.seq,
                rnd: state.rnd,
                v_rnd: state.v_rnd,
                v_val: state.v_val.clone(),
            })
        } else {
            None
        }
    }

    /// Section 4.1, `On ACCEPT-REQUEST`.
    pub fn on_accept_request(&mut self, a: AcceptRequest<T>) -> Option<Decide<T>> {
        let state = self.states.get_mut(&a.inst)?;
        if a.c_rnd < state.rnd {
            return None;
        }

        state.v_rnd = Some(a.c_rnd);
        state.v_val = Some(a.c_val.clone());
        if state.decision.is_none() {
            state.decision = Some((a.seq, a.c_val.clone()));
        }

        Some(Decide { inst: a.inst, seq: a.seq, v_rnd: a.c_rnd, v_val: a.c_val })
    }

    /// Section 4.1, `On CATCHUP-REQUEST`. Instances this acceptor never decided are silently
    /// omitted from the reply (Section 7: "catch-up target unknown at acceptor").
    pub fn on_catchup_request(&mut self, req: CatchupRequest) -> Option<CatchupValues<T>> {
        let catchup_inst: Vec<_> = req
            .missing_inst
            .into_iter()
            .filter_map(|inst| {
                self.states
                    .get(&inst)
                    .and_then(|s| s.decision.clone())
                    .map(|(seq, val)| (inst, seq, val))
            })
            .collect();

        if catchup_inst.is_empty() {
            None
        } else {
            Some(CatchupValues { catchup_inst })
        }
    }
}

/// The networked acceptor role: an [`AcceptorCore`] plumbed to a multicast socket.
pub struct Acceptor<T> {
    id: u64,
    core: AcceptorCore<T>,
    node: NetNode<T>,
    proposers_address: SocketAddrV4,
    learners_address: SocketAddrV4,
}

impl<T> Acceptor<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug,
{
    pub fn new(
        id: u64,
        acceptors_address: SocketAddrV4,
        proposers_address: SocketAddrV4,
        learners_address: SocketAddrV4,
    ) -> Self {
        Acceptor {
            id,
            core: AcceptorCore::new(id),
            node: NetNode::new(&acceptors_address, POLL_TIMEOUT),
            proposers_address,
            learners_address,
        }
    }

    pub fn run(&mut self, shutdown: &ShutdownFlag) {
        while !shutdown.requested() {
            match self.node.receive() {
                Some(Message::Phase1a(p)) => {
                    if let Some(promise) = self.core.on_preparation(p) {
                        if log_enabled!(Level::Info) {
                            info!("[A={}] {:?}", self.id, promise);
                        }
                        self.node.send(&Message::Phase1b(promise), &self.proposers_address);
                    }
                }
                Some(Message::Phase2a(a)) => {
                    if let Some(decide) = self.core.on_accept_request(a) {
                        if log_enabled!(Level::Info) {
                            info!("[A={}] {:?}", self.id, decide);
                        }
                        let m = Message::Phase3(decide);
                        self.node.send(&m, &self.learners_address);
                        self.node.send(&m, &self.proposers_address);
                    }
                }
                Some(Message::CatchupRequest(r)) => {
                    if let Some(values) = self.core.on_catchup_request(r) {
                        if log_enabled!(Level::Info) {
                            info!("[A={}] {:?}", self.id, values);
                        }
                        self.node.send(&Message::CatchupValues(values), &self.learners_address);
                    }
                }
                Some(other) => {
                    debug!("[A={}] ignoring unexpected message {:?}", self.id, other);
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(inst: Instance, counter: u64, node_id: u64, seq: Seq) -> Preparation {
        Preparation { inst, c_rnd: Round::new(counter, node_id), seq }
    }

    #[test]
    fn first_prepare_is_always_promised() {
        let mut a = AcceptorCore::<String>::new(1);
        let promise = a.on_preparation(prepare(0, 1, 7, Seq::new(1, 1))).unwrap();
        assert_eq!(promise.rnd, Round::new(1, 7));
        assert_eq!(promise.v_rnd, None);
        assert_eq!(promise.v_val, None);
    }

    #[test]
    fn stale_prepare_is_dropped() {
        let mut a = AcceptorCore::<String>::new(1);
        a.on_preparation(prepare(0, 2, 7, Seq::new(1, 1))).unwrap();
        assert!(a.on_preparation(prepare(0, 1, 9, Seq::new(1, 1))).is_none());
    }

    #[test]
    fn accept_without_prior_prepare_is_dropped() {
        let mut a = AcceptorCore::<String>::new(1);
        let req = AcceptRequest {
            inst: 0,
            seq: Seq::new(1, 1),
            c_rnd: Round::new(1, 7),
            c_val: "A".to_owned(),
        };
        assert!(a.on_accept_request(req).is_none());
    }

    #[test]
    fn accept_at_or_above_promised_round_decides() {
        let mut a = AcceptorCore::<String>::new(1);
        a.on_preparation(prepare(0, 1, 7, Seq::new(1, 1))).unwrap();
        let req = AcceptRequest {
            inst: 0,
            seq: Seq::new(1, 1),
            c_rnd: Round::new(1, 7),
            c_val: "A".to_owned(),
        };
        let decide = a.on_accept_request(req).unwrap();
        assert_eq!(decide.v_val, "A");
    }

    #[test]
    fn accept_below_promised_round_is_dropped() {
        let mut a = AcceptorCore::<String>::new(1);
        a.on_preparation(prepare(0, 2, 7, Seq::new(1, 1))).unwrap();
        let req = AcceptRequest {
            inst: 0,
            seq: Seq::new(1, 1),
            c_rnd: Round::new(1, 9),
            c_val: "B".to_owned(),
        };
        assert!(a.on_accept_request(req).is_none());
    }

    #[test]
    fn catchup_omits_instances_never_decided() {
        let mut a = AcceptorCore::<String>::new(1);
        a.on_preparation(prepare(0, 1, 7, Seq::new(1, 1))).unwrap();
        a.on_accept_request(AcceptRequest {
            inst: 0,
            seq: Seq::new(1, 1),
            c_rnd: Round::new(1, 7),
            c_val: "A".to_owned(),
        });

        let values = a
            .on_catchup_request(CatchupRequest { missing_inst: vec![0, 1] })
            .unwrap();
        assert_eq!(values.catchup_inst.len(), 1);
        assert_eq!(values.catchup_inst[0].0, 0);
    }

    #[test]
    fn catchup_with_nothing_decided_answers_nothing() {
        let mut a = AcceptorCore::<String>::new(1);
        assert!(a.on_catchup_request(CatchupRequest { missing_inst: vec![0, 1] }).is_none());
    }

    #[test]
    fn repeated_identical_accept_is_idempotent() {
        let mut a = AcceptorCore::<String>::new(1);
        a.on_preparation(prepare(0, 1, 7, Seq::new(1, 1))).unwrap();
        let req = || AcceptRequest {
            inst: 0,
            seq: Seq::new(1, 1),
            c_rnd: Round::new(1, 7),
            c_val: "A".to_owned(),
        };
        let first = a.on_accept_request(req()).unwrap();
        let second = a.on_accept_request(req()).unwrap();
        assert_eq!(first.v_val, second.v_val);
        assert_eq!(first.v_rnd, second.v_rnd);
    }
}
