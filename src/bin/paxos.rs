//! Process entrypoint. Usage: `paxos <config_path> <role> <id>`, where
//! `role in {acceptor, proposer, learner, client}` and `id` is the integer node identity.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate multi_paxos;

use std::io::{self, BufRead};
use std::process;

use multi_paxos::configurations::{self, RoleConfig};
use multi_paxos::{acceptor::Acceptor, client, learner::Learner, proposer::Proposer, shutdown};

fn usage_error(msg: &str) -> ! {
    eprintln!("error: {}", msg);
    eprintln!("usage: paxos <config_path> <role> <id>");
    process::exit(1);
}

fn address(config: &RoleConfig, role: &str) -> std::net::SocketAddrV4 {
    match config.get(role) {
        Some((_, addr)) => *addr,
        None => usage_error(&format!("configuration has no entry for role '{}'", role)),
    }
}

fn cardinality(config: &RoleConfig, role: &str) -> usize {
    match config.get(role) {
        Some((size, _)) => *size,
        None => usage_error(&format!("configuration has no entry for role '{}'", role)),
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        usage_error("expected exactly 3 arguments: <config_path> <role> <id>");
    }

    let config_path = &args[1];
    let role = args[2].as_str();
    let id: u64 = match args[3].parse() {
        Ok(id) => id,
        Err(_) => usage_error("<id> must be a non-negative integer"),
    };

    let config = match configurations::get_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let acceptors_address = address(&config, "acceptors");
    let proposers_address = address(&config, "proposers");
    let learners_address = address(&config, "learners");
    let clients_address = address(&config, "clients");
    let num_of_acceptors = cardinality(&config, "acceptors");

    let shutdown = shutdown::install();

    match role {
        "acceptor" => {
            info!("[A={}] starting acceptor", id);
            let mut a: Acceptor<String> =
                Acceptor::new(id, acceptors_address, proposers_address, learners_address);
            a.run(&shutdown);
        }
        "proposer" => {
            info!("[P={}] starting proposer", id);
            let mut p: Proposer<String> = Proposer::new(
                id,
                proposers_address,
                acceptors_address,
                learners_address,
                num_of_acceptors,
            );
            p.run(&shutdown);
        }
        "learner" => {
            info!("[L={}] starting learner", id);
            let mut l: Learner<String> = Learner::new(id, learners_address, acceptors_address);
            l.run(&shutdown);
        }
        "client" => {
            info!("[C={}] starting client", id);
            let stdin = io::stdin();
            client::run(id, clients_address, proposers_address, stdin.lock(), &shutdown);
        }
        other => usage_error(&format!("unknown role '{}'", other)),
    }
}
