// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A passive side that never answers must make the active side's
//! `awaitAcknowledge` time out rather than block forever (spec.md §8
//! scenario S5).

use netmeter_core::control::{accept_blocking, await_acknowledge, connect_data_socket, listen_socket};
use netmeter_core::error::Error;
use netmeter_core::reader::{FramedSocket, MessageReader};
use netmeter_core::trafficspec::Protocol;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[test]
fn ack_await_times_out_when_peer_is_silent() {
    let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 58_301);
    let listener = listen_socket(Protocol::Tcp, &[listen_addr]).expect("listen");

    let accept_thread = std::thread::spawn(move || {
        // Accept and hold the connection open, but never write anything back.
        let (socket, _peer) = accept_blocking(&listener, Some(Duration::from_secs(5))).expect("accept");
        std::thread::sleep(Duration::from_secs(2));
        drop(socket);
    });

    let client = connect_data_socket(
        Protocol::Tcp,
        &[SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)],
        listen_addr,
        0,
        Duration::from_secs(5),
        false,
    )
    .expect("connect");

    let mut reader = MessageReader::new();
    reader.add_socket(client.raw_fd());

    let result = await_acknowledge(&client, &mut reader, 1, 1, 0, Some(Duration::from_millis(300)));

    match result {
        Err(Error::AckTimeout(_)) => {}
        other => panic!("expected AckTimeout, got {other:?}"),
    }

    accept_thread.join().expect("accept thread panicked");
}
