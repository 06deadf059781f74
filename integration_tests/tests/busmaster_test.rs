use std::sync::Arc;

use esdcan_driver::busmaster::{BusmasterEvent, BusmasterRecord, FrameEvent, FrameFlags};
use integration_tests::prelude::*;

fn rx_record(card: &Card, msg: CanMessage) -> BusmasterRecord {
    BusmasterRecord::new(
        0,
        card.timers().now(),
        BusmasterEvent::RxTxDone(FrameEvent {
            msg,
            flags: FrameFlags::empty(),
            tag: 0,
        }),
    )
}

#[test]
fn test_fifo_overflow_is_accounted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let card = Card::new(
        card_config("BM000001", 0, 1),
        Arc::new(LoopbackController::new()),
        None,
    )
    .unwrap();
    let node = card.node(0).unwrap().clone();
    let session = Session::open(node.clone(), OpenParams::default().with_queues(512, 0)).unwrap();
    session.id_add(CanId::std(0x72)).unwrap();

    // Nothing drains while the records are posted
    let port = card.port();
    let accepted = (0..300u32)
        .filter(|i| port.post(&rx_record(&card, frame(0x72, &[*i as u8]))))
        .count();
    assert_eq!(256, accepted);

    let summary = card.dpc();
    assert_eq!(256, summary.processed);
    assert_eq!(44, summary.dropped);
    assert_eq!(0, summary.skipped);

    let stats = node.bus_statistics();
    assert_eq!(44, stats.fifo_ovr);
    assert_eq!(256, stats.rcv_count.std_data);

    let mut buf = vec![CanMessage::default(); 300];
    assert_eq!(256, session.take(&mut buf).unwrap());
    for (i, msg) in buf[..256].iter().enumerate() {
        assert_eq!(&[i as u8], msg.data());
    }
    let lost: u32 = buf[..256].iter().map(|m| m.msg_lost as u32).sum();
    assert_eq!(44, lost);

    // The next pass starts in sync with the hardware counter
    for i in 0..3u8 {
        assert!(port.post(&rx_record(&card, frame(0x72, &[i]))));
    }
    let summary = card.dpc();
    assert_eq!(3, summary.processed);
    assert_eq!(0, summary.dropped);
    assert_eq!(0, summary.skipped);
}

#[test]
fn test_full_receive_queue_counts_lost_frames() {
    let _ = env_logger::builder().is_test(true).try_init();
    let card = Card::new(
        card_config("BM000002", 0, 1),
        Arc::new(LoopbackController::new()),
        None,
    )
    .unwrap();
    let node = card.node(0).unwrap().clone();
    let session = Session::open(node.clone(), OpenParams::default().with_queues(4, 0)).unwrap();
    session.id_add(CanId::std(0x10)).unwrap();

    let port = card.port();
    for i in 0..10u8 {
        port.post(&rx_record(&card, frame(0x10, &[i])));
    }
    card.dpc();

    let mut buf = [CanMessage::default(); 10];
    assert_eq!(4, session.take(&mut buf).unwrap());
    assert_eq!(&[0], buf[0].data());
    assert_eq!(6, buf[0].msg_lost);
    assert_eq!(6, node.bus_statistics().fifo_ovr);
}

#[test]
fn test_events_reach_only_subscribed_sessions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let card = Card::new(
        card_config("BM000003", 0, 1),
        Arc::new(LoopbackController::new()),
        None,
    )
    .unwrap();
    let node = card.node(0).unwrap().clone();
    let listening = Session::open(node.clone(), OpenParams::default()).unwrap();
    listening
        .id_add(CanId::event(esdcan_common::constants::ids::EV_BUSLOAD))
        .unwrap();
    let other = Session::open(node.clone(), OpenParams::default()).unwrap();

    card.port().post(&BusmasterRecord::new(
        0,
        card.timers().now(),
        BusmasterEvent::Statistic { busload: 1234 },
    ));
    card.dpc();

    let mut buf = [CanMessage::default(); 2];
    assert_eq!(1, listening.take(&mut buf).unwrap());
    assert_eq!(&1234u32.to_le_bytes(), buf[0].data());
    assert_eq!(0, other.take(&mut buf).unwrap());
    assert_eq!(1234, node.bus_statistics().busload);
}

#[test]
fn test_lost_tx_records_release_transmit_slots() {
    let _ = env_logger::builder().is_test(true).try_init();
    let card = Card::new(
        card_config("BM000004", 0, 1),
        Arc::new(LoopbackController::new()),
        None,
    )
    .unwrap();
    let node = card.node(0).unwrap().clone();
    let session = Session::open(node.clone(), OpenParams::default()).unwrap();

    // Fill the FIFO so that every completion of the next transmissions is lost
    let port = card.port();
    for i in 0..256u32 {
        assert!(port.post(&rx_record(&card, frame(0x72, &[i as u8]))));
    }
    let frames: Vec<CanMessage> = (0..16).map(|i| frame(0x90, &[i])).collect();
    assert_eq!(16, session.send(&frames).unwrap());

    let summary = card.dpc();
    assert_eq!(256, summary.processed);
    assert_eq!(32, summary.dropped);
    let stats = node.bus_statistics();
    assert_eq!(32, stats.fifo_ovr);
    assert_eq!(16, stats.aborted_frames);
    assert_eq!(0, stats.xmit_count.std_data);

    // All slots are free again
    assert_eq!(1, session.send(&[frame(0x91, &[1])]).unwrap());
    card.dpc();
    let stats = node.bus_statistics();
    assert_eq!(1, stats.xmit_count.std_data);
    assert_eq!(16, stats.aborted_frames);
}
