//! Learning, unicast, flooding and mirror behavior end to end.

mod harness;

use harness::*;

use vswitch::factory::PortFactory;
use vswitch::filter::{EtherTypeFilter, PacketFilter};
use vswitch::mac_table::PortId;
use vswitch::switch::VirtioSwitch;

fn factory() -> PortFactory {
    PortFactory::new(256, false, Vec::new())
}

/// N native ports, each with an attached guest holding `rx_bufs`
/// receive buffers of 1536 bytes.
fn native_setup(n: usize, rx_bufs: usize) -> (VirtioSwitch, Vec<(PortId, TestGuest)>) {
    let mut sw = VirtioSwitch::new(n);
    let f = factory();
    let mut guests = Vec::new();
    for i in 0..n {
        let name = format!("name=port{i}");
        let id = f.create(&mut sw, &[name.as_str()]).unwrap().unwrap();
        let mut guest = TestGuest::attach(vport(&mut sw, id), 64);
        for _ in 0..rx_bufs {
            guest.add_rx_buffer(1536);
        }
        guests.push((id, guest));
    }
    (sw, guests)
}

#[test]
fn learn_and_unicast() {
    let (mut sw, mut guests) = native_setup(3, 2);

    // A -> unknown destination: flooded to B and C.
    let frame = ether_frame(mac(2), mac(1), 50);
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &frame);
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert_eq!(guests[0].1.tx_completions(), 1);

    let got_b = guests[1].1.recv_frames();
    let got_c = guests[2].1.recv_frames();
    assert_eq!(got_b.len(), 1);
    assert_eq!(got_c.len(), 1);
    assert_eq!(got_b[0].1, frame);

    // B replies: the switch learned A's MAC, so only A receives.
    let reply = ether_frame(mac(1), mac(2), 50);
    {
        let (b, gb) = &mut guests[1];
        gb.queue_tx_frame(&plain_hdr(), &reply);
        let b = *b;
        sw.handle_port_tx(b);
    }
    assert_eq!(guests[1].1.tx_completions(), 1);
    assert_eq!(guests[0].1.recv_frames().len(), 1);
    assert!(guests[2].1.recv_frames().is_empty());
}

#[test]
fn broadcast_reaches_every_port_once() {
    let (mut sw, mut guests) = native_setup(4, 4);

    let frame = ether_frame(BROADCAST, mac(1), 40);
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &frame);
        let a = *a;
        sw.handle_port_tx(a);
    }

    assert!(guests[0].1.recv_frames().is_empty());
    for (_, guest) in &mut guests[1..] {
        assert_eq!(guest.recv_frames().len(), 1);
    }
}

#[test]
fn hairpin_suppression() {
    let (mut sw, mut guests) = native_setup(3, 2);

    // Teach the switch that mac(1) lives behind port A.
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(mac(9), mac(1), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }
    for (_, guest) in &mut guests {
        guest.recv_frames();
    }

    // A frame from A whose destination maps back to A: dropped, no
    // deliveries anywhere.
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(mac(1), mac(3), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert_eq!(guests[0].1.tx_completions(), 2);
    for (_, guest) in &mut guests {
        assert!(guest.recv_frames().is_empty());
    }
}

#[test]
fn runt_tx_request_is_completed_and_skipped() {
    let (mut sw, mut guests) = native_setup(2, 2);

    // Shorter than the virtio-net header: consumed, completed with a
    // zero-length used entry, nothing forwarded.
    {
        let (a, ga) = &mut guests[0];
        let addr = ga.alloc(6);
        ga.tx.add_buf(&ga.mem, &[(addr, 6)], false).unwrap();
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert_eq!(guests[0].1.tx_completions(), 1);
    assert!(guests[1].1.recv_frames().is_empty());

    // The port keeps working afterwards.
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(BROADCAST, mac(1), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert_eq!(guests[1].1.recv_frames().len(), 1);
}

#[test]
fn split_header_chain_is_forwarded() {
    let (mut sw, mut guests) = native_setup(2, 2);

    let frame = ether_frame(BROADCAST, mac(1), 100);
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame_split(&plain_hdr(), &frame);
        let a = *a;
        sw.handle_port_tx(a);
    }
    let got = guests[1].1.recv_frames();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, frame);
}

#[test]
fn destination_interrupts_are_coalesced() {
    let (mut sw, mut guests) = native_setup(2, 16);

    // Several frames in one drain: the destination sees exactly one
    // interrupt covering all of them.
    {
        let (a, ga) = &mut guests[0];
        for _ in 0..10 {
            ga.queue_tx_frame(&plain_hdr(), &ether_frame(mac(2), mac(1), 30));
        }
        let a = *a;
        sw.handle_port_tx(a);
    }
    // mac(2) is unknown, so these flooded to B only (no other ports).
    assert_eq!(guests[1].1.recv_frames().len(), 10);
    assert_eq!(guests[1].1.irq_count(), 1);
}

#[test]
fn monitor_mirrors_unicast() {
    let (mut sw, mut guests) = native_setup(3, 4);
    let f = factory();
    f.create(&mut sw, &["type=monitor"]).unwrap();
    let mut mon = TestGuest::attach(vmonitor(&mut sw), 64);
    for _ in 0..4 {
        mon.add_rx_buffer(1536);
    }

    // Learn both stations.
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(mac(2), mac(1), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }
    {
        let (b, gb) = &mut guests[1];
        gb.queue_tx_frame(&plain_hdr(), &ether_frame(mac(1), mac(2), 30));
        let b = *b;
        sw.handle_port_tx(b);
    }
    mon.recv_frames();

    // A unicast A->B is mirrored exactly once.
    let frame = ether_frame(mac(2), mac(1), 60);
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &frame);
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert_eq!(guests[1].1.recv_frames().len(), 1);
    assert!(guests[2].1.recv_frames().is_empty());
    let mirrored = mon.recv_frames();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].1, frame);
}

#[test]
fn filter_applies_to_mirror_path_only() {
    let (mut sw, mut guests) = native_setup(2, 4);
    let f = factory();
    f.create(&mut sw, &["type=monitor"]).unwrap();
    let mut mon = TestGuest::attach(vmonitor(&mut sw), 64);
    for _ in 0..4 {
        mon.add_rx_buffer(1536);
    }
    sw.set_filter(Box::new(EtherTypeFilter::new(vec![
        smoltcp::wire::EthernetProtocol::Ipv4,
    ])));

    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(BROADCAST, mac(1), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }

    // The primary path is never filtered; the mirror copy is.
    assert_eq!(guests[1].1.recv_frames().len(), 1);
    assert!(mon.recv_frames().is_empty());
}

#[test]
fn monitor_tx_is_drained_without_forwarding() {
    let (mut sw, mut guests) = native_setup(2, 2);
    let f = factory();
    f.create(&mut sw, &["type=monitor"]).unwrap();
    let mut mon = TestGuest::attach(vmonitor(&mut sw), 64);

    mon.queue_tx_frame(&plain_hdr(), &ether_frame(BROADCAST, mac(7), 30));
    sw.handle_monitor_kick();

    assert_eq!(mon.tx_completions(), 1);
    for (_, guest) in &mut guests {
        assert!(guest.recv_frames().is_empty());
    }
}

#[test]
fn default_filter_mirrors_everything() {
    struct DropAll;
    impl PacketFilter for DropAll {
        fn should_drop(&self, _: &[u8]) -> bool {
            true
        }
    }

    let (mut sw, mut guests) = native_setup(2, 2);
    let f = factory();
    f.create(&mut sw, &["type=monitor"]).unwrap();
    let mut mon = TestGuest::attach(vmonitor(&mut sw), 64);
    for _ in 0..2 {
        mon.add_rx_buffer(1536);
    }

    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(BROADCAST, mac(1), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert_eq!(mon.recv_frames().len(), 1);

    sw.set_filter(Box::new(DropAll));
    {
        let (a, ga) = &mut guests[0];
        ga.queue_tx_frame(&plain_hdr(), &ether_frame(BROADCAST, mac(1), 30));
        let a = *a;
        sw.handle_port_tx(a);
    }
    assert!(mon.recv_frames().is_empty());
    // B still received both.
    assert_eq!(guests[1].1.recv_frames().len(), 2);
}
