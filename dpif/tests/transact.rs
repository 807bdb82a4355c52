// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Daemon-side integration: transactions against live pipeline threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use datapath::{Pipeline, PipelineConfig, Switch};
use dpif::DpifClient;

use ctl::message::{FLAG_CREATE, FLAG_REPLACE, Message, MessageBody, VportCmd, VportMessage};
use errno::ErrCode;
use flow::TscClock;
use flow::action::{Action, ActionList};
use net::FlowKey;
use net::buffer::PacketBuf;
use ring::Ring;
use vport::registry::VportIo;
use vport::types::VportType;

fn tmp(tag: &str, which: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("uswitch-dpif-{tag}-{which}-{}", std::process::id()));
    p
}

struct Fixture {
    switch: Arc<Switch>,
    pipelines: Vec<Pipeline>,
    client_rings: Vec<Arc<Ring<PacketBuf>>>,
}

fn fixture(tag: &str, n_pipelines: u32) -> Fixture {
    let switch = Arc::new(Switch::new(4096, TscClock::with_hz(1_000_000_000)));

    // a handful of client ports for flows to point at
    let mut client_rings = Vec::new();
    for id in 0..4u32 {
        let to_guest = Arc::new(Ring::new(64));
        let from_guest = Arc::new(Ring::new(64));
        switch
            .vports
            .configure(
                id,
                VportIo::RingPair {
                    to_guest: Arc::clone(&to_guest),
                    from_guest,
                },
            )
            .unwrap();
        client_rings.push(to_guest);
    }

    let pipelines = (0..n_pipelines)
        .map(|id| {
            let mut config = PipelineConfig::new(id);
            config.flow_capacity = 256;
            config.wake_path = tmp(tag, &format!("wake-{id}"));
            Pipeline::new(Arc::clone(&switch), config).unwrap()
        })
        .collect();

    Fixture {
        switch,
        pipelines,
        client_rings,
    }
}

fn with_running_pipelines<T>(fixture: Fixture, body: impl FnOnce(&Switch) -> T) -> T {
    let stop = Arc::new(AtomicBool::new(false));
    let switch = Arc::clone(&fixture.switch);
    let result = std::thread::scope(|scope| {
        for mut pipe in fixture.pipelines {
            let stop = Arc::clone(&stop);
            scope.spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    pipe.run_once();
                    std::thread::yield_now();
                }
            });
        }
        let result = body(&switch);
        stop.store(true, Ordering::Release);
        result
    });
    drop(fixture.client_rings);
    result
}

fn attach(switch: &Switch, tag: &str, pipelines: &[u32]) -> DpifClient {
    DpifClient::attach(
        &switch.rings,
        pipelines,
        tmp(tag, "flows"),
        tmp(tag, "vports"),
        256,
    )
    .unwrap()
}

fn tcp_key(port: u32, n: u8) -> FlowKey {
    FlowKey {
        in_port: port,
        ether_type: 0x0800,
        ip_proto: 6,
        ip_src: u32::from(n),
        tran_dst_port: 80,
        ..FlowKey::default()
    }
}

fn one_output(vport: u32) -> ActionList {
    let mut actions = ActionList::new();
    actions.push(Action::Output { vport });
    actions
}

#[test]
fn transact_echoes_thread_id_and_requeues_foreign_replies() {
    let fixture = fixture("tid", 1);
    with_running_pipelines(fixture, |switch| {
        let client = attach(switch, "tid", &[0]);

        // park a reply addressed to some other thread on the ring
        let chans = ctl::ChannelSet::attach(&switch.rings, 0).unwrap();
        let mut foreign = VportMessage::request(VportCmd::Get, 9);
        foreign.thread_id = 0xDEAD_BEEF;
        chans
            .reply
            .enqueue(Message {
                error: 0,
                body: MessageBody::Vport(foreign),
            })
            .unwrap();

        // a real request: the foreign reply must be skipped, ours claimed
        let mut get = VportMessage::request(VportCmd::Get, u32::MAX);
        get.flags = ctl::message::FLAG_DUMP;
        let reply = client
            .transact(0, Message::request(MessageBody::Vport(get)))
            .unwrap();
        // no enabled ports yet: the dump answers EOF, addressed to us
        assert_eq!(reply.err(), Some(ErrCode::Eof));
        assert_ne!(reply.thread_id(), 0xDEAD_BEEF);

        // the foreign reply is back on the ring, unmodified
        let parked = chans.reply.dequeue().expect("foreign reply preserved");
        assert_eq!(parked.thread_id(), 0xDEAD_BEEF);
        assert_eq!(parked.error, 0);

        // an unknown-family request draws an INVAL reply which transact
        // surfaces as an unintelligible-reply error
        assert!(matches!(
            client.transact(0, Message::request(MessageBody::Unknown { mtype: 0x42 })),
            Err(dpif::DpifError::BadReply(0))
        ));
    });
}

#[test]
fn vport_add_round_robins_across_pipelines() {
    let fixture = fixture("rr", 2);
    with_running_pipelines(fixture, |switch| {
        let client = attach(switch, "rr", &[0, 1]);

        let a = client.vport_add(VportType::Client, None, "guest-a").unwrap();
        let b = client.vport_add(VportType::Client, None, "guest-b").unwrap();
        assert_ne!(a.vportid, b.vportid);

        let shadow_a = client.vport_shadow().get(a.vportid).unwrap();
        let shadow_b = client.vport_shadow().get(b.vportid).unwrap();
        assert!(shadow_a.in_use && shadow_b.in_use);
        assert_ne!(shadow_a.lcore, shadow_b.lcore, "round-robin placement");

        client.vport_del(a.vportid).unwrap();
        assert!(!client.vport_shadow().get(a.vportid).unwrap().in_use);

        client.vport_shadow().reset();
    });
}

#[test]
fn flow_lifecycle_updates_shadow() {
    let fixture = fixture("flow", 1);
    with_running_pipelines(fixture, |switch| {
        let client = attach(switch, "flow", &[0]);
        client.vport_add(VportType::Client, Some(0), "ingress").unwrap();

        let key = tcp_key(0, 1);
        let put = client
            .flow_put(key, one_output(1), FLAG_CREATE, false)
            .unwrap();
        assert_ne!(put.flow_handle, 0);
        assert_eq!(client.flow_shadow().find(&key), Some(put.flow_handle));

        let got = client.flow_get(key).unwrap();
        assert_eq!(got.actions, one_output(1));
        assert_eq!(got.stats.packet_count, 0);

        let replaced = client
            .flow_put(key, one_output(2), FLAG_REPLACE, true)
            .unwrap();
        assert_eq!(replaced.flow_handle, put.flow_handle);

        let del = client.flow_del(key).unwrap();
        assert_eq!(del.stats.packet_count, 0);
        assert_eq!(client.flow_shadow().find(&key), None);
        assert!(matches!(
            client.flow_get(key),
            Err(dpif::DpifError::Code(ErrCode::NoEnt))
        ));

        client.flow_shadow().reset();
        client.vport_shadow().reset();
    });
}

#[test]
fn flow_dump_walks_and_terminates() {
    let fixture = fixture("dump", 1);
    with_running_pipelines(fixture, |switch| {
        let client = attach(switch, "dump", &[0]);
        client.vport_add(VportType::Client, Some(0), "ingress").unwrap();

        for n in 1..=3 {
            client
                .flow_put(tcp_key(0, n), one_output(1), FLAG_CREATE, false)
                .unwrap();
        }

        let mut seen = 0;
        let mut cursor = None;
        while let Some(body) = client.flow_dump_next(0, cursor).unwrap() {
            cursor = Some(body.key);
            seen += 1;
            assert!(seen <= 3, "dump must terminate");
        }
        assert_eq!(seen, 3);

        client.flow_flush().unwrap();
        assert!(client.flow_shadow().is_empty());
        assert!(client.flow_dump_next(0, None).unwrap().is_none());

        client.vport_shadow().reset();
    });
}

#[test]
fn packet_execute_uses_alloc_ring_buffers() {
    let fixture = fixture("pkt", 1);
    let client_ring = Arc::clone(&fixture.client_rings[1]);
    with_running_pipelines(fixture, |switch| {
        let client = attach(switch, "pkt", &[0]);
        client.vport_add(VportType::Client, Some(1), "egress").unwrap();

        // let the pipeline stock the alloc rings
        while switch.rings.lookup::<PacketBuf>(&ring::names::packet_alloc_ring(0)).unwrap().is_empty() {
            std::thread::yield_now();
        }

        let frame = net::test_frames::FrameSpec {
            udp: Some((4000, 53)),
            ..net::test_frames::FrameSpec::default()
        }
        .build();
        client.packet_execute(0, one_output(1), &frame).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(out) = client_ring.dequeue() {
                assert_eq!(out.bytes(), &frame[..]);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "packet not delivered");
            std::thread::yield_now();
        }

        client.vport_shadow().reset();
    });
}
