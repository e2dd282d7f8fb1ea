//! The client role: reads newline-delimited values from standard input and submits each as a
//! `CLIENT_VALUE` to the proposer group.

use std::io::BufRead;
use std::net::SocketAddrV4;
use std::thread;
use std::time::Duration;

use log::Level;

use crate::message::{ClientValue, Message};
use crate::net_node::NetNode;
use crate::shutdown::ShutdownFlag;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// A short pacing delay between successive submissions, so that a client piping many lines in
/// quick succession does not burst the loopback multicast group hard enough to trigger the
/// kernel's own packet loss (Section 4.4).
const SUBMIT_PACING: Duration = Duration::from_millis(2);

/// Runs the client: consumes `input` line by line until EOF or shutdown, submitting each
/// non-empty trimmed line as a value.
pub fn run(
    id: u64,
    clients_address: SocketAddrV4,
    proposers_address: SocketAddrV4,
    input: impl BufRead,
    shutdown: &ShutdownFlag,
) {
    let node: NetNode<String> = NetNode::new(&clients_address, POLL_TIMEOUT);
    let mut prop_id: u64 = 0;

    for line in input.lines() {
        if shutdown.requested() {
            break;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("[C={}] error reading input: {}", id, e);
                break;
            }
        };

        let value = line.trim();
        if value.is_empty() {
            continue;
        }

        prop_id += 1;
        let cv = ClientValue { value: value.to_owned(), client_id: id, prop_id };
        if log_enabled!(Level::Info) {
            info!("[C={}] {:?}", id, cv);
        }
        node.send(&Message::ClientValue(cv), &proposers_address);

        thread::sleep(SUBMIT_PACING);
    }
}
