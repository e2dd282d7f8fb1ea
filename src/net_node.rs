//! A struct which can be used to send to or receive from a UDP multicast group.

use std::fmt::Debug;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use net2::UdpBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::Message;

/// Datagrams above this size are not supported (Section 6).
const MAX_DATAGRAM_SIZE: usize = 65536;

/// A struct which can be used to send to or receive from a UDP socket joined to a multicast
/// group.
pub struct NetNode<T> {
    udp_socket_sender: UdpSocket,

    udp_socket_receiver: UdpSocket,

    // Dummy data that is associated with the type of the value that a client initially proposes.
    value: PhantomData<T>,
}

impl<T> NetNode<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug,
{
    /// Joins the multicast group at `multicast_address_v4`. `poll_timeout` bounds how long
    /// `receive` blocks, so that a role's event loop can interleave message handling with
    /// periodic housekeeping (retry/catch-up ticks) on a single thread.
    pub fn new(multicast_address_v4: &SocketAddrV4, poll_timeout: Duration) -> Self {
        // Create the UdpSocket to send messages to other sockets. This socket does not have to
        // bind to a specific port, but just to one available, hence we use 0 as the port, which
        // is used to do that.
        let udp_socket_sender = UdpSocket::bind("0.0.0.0:0").expect("could not bind sender socket");

        udp_socket_sender
            .set_multicast_loop_v4(true)
            .expect("set_multicast_loop_v4 call failed");

        // Create a UdpSocket to receive messages from other sockets on the same address as the
        // multicast group one.
        let udp_socket_receiver = UdpBuilder::new_v4()
            .expect("could not construct UdpBuilder")
            // Multiple sockets could bind to the same multicast group address, so we need this.
            .reuse_address(true)
            .expect("could not reuse address")
            // Bind the receiver socket to the same host as the multicast group.
            .bind(multicast_address_v4)
            .expect("could not bind to address");

        // Let the socket that wants to receive messages join its corresponding multicast group.
        udp_socket_receiver
            .join_multicast_v4(multicast_address_v4.ip(), &Ipv4Addr::UNSPECIFIED)
            .expect("could not join multicast group");

        udp_socket_receiver
            .set_read_timeout(Some(poll_timeout))
            .expect("could not set read timeout");

        NetNode {
            udp_socket_sender,
            udp_socket_receiver,
            value: PhantomData,
        }
    }

    /// Sends the message m to the socket with address destination_address. A serialization
    /// failure (which should never happen for well-formed `T`) is logged and dropped rather than
    /// panicking a role process over an outbound message.
    pub fn send(&self, m: &Message<T>, destination_address: &SocketAddrV4) {
        match serde_json::to_vec(m) {
            Ok(encoded) => {
                if let Err(e) = self.udp_socket_sender.send_to(&encoded, destination_address) {
                    warn!("could not send {:?} to {}: {}", m, destination_address, e);
                }
            }
            Err(e) => warn!("could not encode {:?}: {}", m, e),
        }
    }

    /// Waits up to the configured poll timeout for a datagram. Returns `None` both on timeout and
    /// on a malformed datagram: the network is untrusted, so a decode failure is just "nothing to
    /// do this tick", not an error the caller needs to handle specially.
    pub fn receive(&self) -> Option<Message<T>> {
        let mut data_received = vec![0; MAX_DATAGRAM_SIZE];

        match self.udp_socket_receiver.recv_from(&mut data_received) {
            Ok((number_of_bytes, _src_addr)) => {
                match serde_json::from_slice(&data_received[..number_of_bytes]) {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        warn!("dropping malformed datagram: {}", e);
                        None
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => None,
            Err(e) => {
                warn!("recv_from failed: {}", e);
                None
            }
        }
    }
}
