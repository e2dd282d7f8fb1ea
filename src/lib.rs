extern crate config;
extern crate ctrlc;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate net2;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

pub mod acceptor;
pub mod client;
pub mod configurations;
pub mod ident;
pub mod learner;
pub mod message;
mod net_node;
pub mod proposer;
pub mod shutdown;
