//! The messages exchanged by the four Multi-Paxos roles over multicast.
//!
//! Every message carries a `type` tag on the wire (`PHASE_1A`, `PHASE_1B`, ...) so that a
//! datagram is self-describing: a decoder never needs side information to know which payload it
//! is looking at.

use crate::ident::{Round, Seq};

/// One slot in the replicated log.
pub type Instance = u64;

/// The messages roles exchange. `T` is the type of the client-submitted value.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum Message<T> {
    #[serde(rename = "PHASE_1A")]
    Phase1a(Preparation),

    #[serde(rename = "PHASE_1B")]
    Phase1b(Promise<T>),

    #[serde(rename = "PHASE_2A")]
    Phase2a(AcceptRequest<T>),

    #[serde(rename = "PHASE_3")]
    Phase3(Decide<T>),

    #[serde(rename = "CLIENT_VALUE")]
    ClientValue(ClientValue<T>),

    #[serde(rename = "CATCHUP_REQUEST")]
    CatchupRequest(CatchupRequest),

    #[serde(rename = "CATCHUP_VALUES")]
    CatchupValues(CatchupValues<T>),
}

/// Phase 1A: a proposer asks the acceptors to promise not to accept below `c_rnd`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct Preparation {
    pub inst: Instance,
    pub c_rnd: Round,
    pub seq: Seq,
}

/// Phase 1B: an acceptor's answer to a `Preparation`, carrying any value it already accepted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Promise<T> {
    pub inst: Instance,
    pub seq: Seq,
    pub rnd: Round,
    pub v_rnd: Option<Round>,
    pub v_val: Option<T>,
}

/// Phase 2A: a proposer asks the acceptors to accept `c_val` in round `c_rnd`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AcceptRequest<T> {
    pub inst: Instance,
    pub seq: Seq,
    pub c_rnd: Round,
    pub c_val: T,
}

/// Phase 3: an acceptor announces that it accepted a value for `inst`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Decide<T> {
    pub inst: Instance,
    pub seq: Seq,
    pub v_rnd: Round,
    pub v_val: T,
}

/// A client's submitted value, addressed to the proposer group.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientValue<T> {
    pub value: T,
    pub client_id: u64,
    pub prop_id: u64,
}

/// A learner's request for the decided values at the listed instances.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CatchupRequest {
    pub missing_inst: Vec<Instance>,
}

/// An acceptor's answer to a `CatchupRequest`, carrying whichever of the requested instances it
/// has a recorded decision for (it may be a strict subset of what was asked).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CatchupValues<T> {
    pub catchup_inst: Vec<(Instance, Seq, T)>,
}
