use std::sync::Arc;
use std::time::Duration;

use assertables::{assert_ge, assert_lt};
use esdcan_common::{constants::ids, duration_to_ticks};
use esdcan_driver::eei::InjectionPattern;
use esdcan_driver::Controller;
use integration_tests::prelude::*;
use serial_test::serial;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[serial]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_releases_blocked_read() {
    init_logging();
    let registry = Registry::new();
    let (_card, _controller) = loopback_card(&registry, "SE000001", 0);

    let session = Arc::new(registry.open(0, OpenParams::default()).unwrap());
    session.id_add(CanId::std(0x50)).unwrap();

    for _ in 0..20 {
        let reader = session.clone();
        let task = tokio::spawn(async move {
            let mut buf = [CanMessage::default(); 4];
            reader.read(&mut buf, Timeout::Infinite).await
        });
        assert!(wait_for(100, || matches!(session.state().0, RxState::PendingRead { .. })).await);
        session.abort_rx();
        assert_eq!(Err(DriverError::Aborted), task.await.unwrap());
    }

    let reader = session.clone();
    let task = tokio::spawn(async move {
        let mut buf = [CanMessage::default(); 4];
        reader.read(&mut buf, Timeout::Infinite).await
    });
    assert!(wait_for(100, || matches!(session.state().0, RxState::PendingRead { .. })).await);
    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .expect("close hung");
    assert_eq!(Err(DriverError::Closed), task.await.unwrap());
    assert!(session.is_closed());
    assert_eq!(0, session.node().open_sessions());

    let mut buf = [CanMessage::default(); 1];
    assert_eq!(Err(DriverError::Closed), session.take(&mut buf));
    assert_eq!(
        Err(DriverError::Closed),
        session.read(&mut buf, Timeout::Immediate).await
    );
}

#[serial]
#[tokio::test]
async fn test_detach_forces_close() {
    init_logging();
    let registry = Registry::new();
    let (_card, _controller) = loopback_card(&registry, "SE000002", 3);

    let session = Arc::new(registry.open(3, OpenParams::default()).unwrap());
    let reader = session.clone();
    let task = tokio::spawn(async move {
        let mut buf = [CanMessage::default(); 1];
        reader.read(&mut buf, Timeout::Infinite).await
    });
    assert!(wait_for(100, || matches!(session.state().0, RxState::PendingRead { .. })).await);

    assert!(registry.detach("SE000002").is_some());
    assert_eq!(Err(DriverError::ForcedClose), task.await.unwrap());
    assert_eq!(
        Err(DriverError::NetNotFound { net: 3 }),
        registry.open(3, OpenParams::default()).map(|_| ())
    );
}

#[serial]
#[tokio::test]
async fn test_write_timeout_and_abort() {
    init_logging();
    let registry = Registry::new();
    let (_card, controller) = loopback_card(&registry, "SE000003", 0);
    controller.set_paused(true);

    let session = Arc::new(registry.open(0, OpenParams::default()).unwrap());
    let frames = [frame(0x60, &[1]), frame(0x60, &[2]), frame(0x60, &[3])];
    assert_eq!(
        Err(DriverError::TxTimeout { completed: 0 }),
        session.write(&frames, Timeout::Millis(20)).await
    );
    assert_eq!(3, controller.held());

    // A blocked writer is released by an abort
    let writer = session.clone();
    let task = tokio::spawn(async move {
        writer
            .write(&[frame(0x61, &[4])], Timeout::Infinite)
            .await
    });
    assert!(wait_for(100, || matches!(session.state().1, TxState::PendingSend { .. })).await);
    session.abort_tx();
    assert_eq!(Err(DriverError::Aborted), task.await.unwrap());
    assert!(wait_for(100, || controller.held() == 0).await);
    assert!(wait_for(100, || session.node().bus_statistics().aborted_frames == 4).await);

    controller.set_paused(false);
    let done = session
        .write(&[frame(0x62, &[5])], Timeout::Millis(100))
        .await
        .unwrap();
    assert_eq!(1, done.count);
    assert_eq!(1, session.node().bus_statistics().xmit_count.std_data);
}

#[serial]
#[tokio::test]
async fn test_send_does_not_wait() {
    init_logging();
    let registry = Registry::new();
    let (_card, controller) = loopback_card(&registry, "SE000004", 0);
    controller.set_paused(true);

    let session = registry.open(0, OpenParams::default()).unwrap();
    let frames: Vec<CanMessage> = (0..4).map(|i| frame(0x70, &[i])).collect();
    assert_eq!(4, session.send(&frames).unwrap());
    assert_eq!(4, controller.held());

    controller.set_paused(false);
    assert!(wait_for(100, || session.node().bus_statistics().xmit_count.std_data == 4).await);
}

#[serial]
#[tokio::test]
async fn test_bus_off_until_baudrate_is_set() {
    init_logging();
    let registry = Registry::new();
    let (_card, controller) = loopback_card(&registry, "SE000005", 0);

    let session = registry.open(0, OpenParams::default()).unwrap();
    session.id_add(CanId::event(ids::EV_CAN_ERROR)).unwrap();
    session.id_add(CanId::event(ids::EV_BAUD_CHANGE)).unwrap();

    let pattern = InjectionPattern::new(&[0x00], 6).unwrap();
    for _ in 0..32 {
        controller.inject_error(0, &pattern).unwrap();
    }
    let node = session.node().clone();
    assert!(wait_for(100, || node.bus_state() == BusState::BusOff).await);
    assert_eq!(32, node.error_counters().bus_errors);

    let mut buf = [CanMessage::default(); 64];
    let n = session.take(&mut buf).unwrap();
    assert_eq!(32, n);
    let last = &buf[n - 1];
    assert_eq!(CanId::event(ids::EV_CAN_ERROR), last.id);
    assert_eq!(BusState::BusOff.to_status_byte(), last.data()[0]);

    assert_eq!(
        Err(DriverError::BusOff),
        session.write(&[frame(0x80, &[1])], Timeout::Millis(50)).await
    );

    node.set_baud(BaudSetting::index(2)).unwrap();
    assert_eq!(BusState::Ok, node.bus_state());
    assert_eq!(1, session.take(&mut buf).unwrap());
    assert_eq!(CanId::event(ids::EV_BAUD_CHANGE), buf[0].id);
    session
        .write(&[frame(0x80, &[1])], Timeout::Millis(100))
        .await
        .unwrap();
}

#[serial]
#[tokio::test]
async fn test_transmit_needs_baudrate_and_active_mode() {
    init_logging();
    let registry = Registry::new();
    let (_card, _controller) = loopback_card(&registry, "SE000006", 0);
    let session = registry.open(0, OpenParams::default()).unwrap();

    session.node().set_baud(BaudSetting::default()).unwrap();
    assert_eq!(Err(DriverError::NoBaudrate), session.send(&[frame(1, &[])]));

    let mut listen = BaudSetting::index(2);
    listen.listen_only = true;
    session.node().set_baud(listen).unwrap();
    assert_eq!(Err(DriverError::ListenOnly), session.send(&[frame(1, &[])]));

    session.node().set_baud(BaudSetting::index(2)).unwrap();
    let listener = registry
        .open(0, OpenParams::new(ModeFlags::LISTEN_ONLY))
        .unwrap();
    assert_eq!(Err(DriverError::ListenOnly), listener.send(&[frame(1, &[])]));
    assert_eq!(1, session.send(&[frame(1, &[])]).unwrap());
}

#[serial]
#[tokio::test]
async fn test_object_mode_keeps_latest_frame() {
    init_logging();
    let registry = Registry::new();
    let (_card, _controller) = loopback_card(&registry, "SE000007", 0);

    let objects = registry.open(0, OpenParams::new(ModeFlags::OBJECT)).unwrap();
    objects.id_region_add(CanId::std(0x200), 2).unwrap();
    let sender = registry.open(0, OpenParams::default()).unwrap();
    sender
        .write(
            &[frame(0x200, &[1]), frame(0x200, &[2]), frame(0x201, &[3, 3])],
            Timeout::Millis(100),
        )
        .await
        .unwrap();

    let mut buf = [CanMessage::default(); 3];
    buf[0].id = CanId::std(0x201);
    buf[1].id = CanId::std(0x200);
    buf[2].id = CanId::std(0x7FF);
    assert_eq!(2, objects.take_objects(&mut buf).unwrap());
    assert_eq!(&[3, 3], buf[0].data());
    assert_eq!(&[2], buf[1].data());
    assert!(buf[2].has_len_flag(esdcan_common::constants::len_flags::NO_DATA));
    assert_eq!(0, buf[2].data_len());

    // Nothing arrived since the last call
    assert_eq!(Err(DriverError::StaleData), objects.take_objects(&mut buf));
    assert_eq!(&[3, 3], buf[0].data());
    sender
        .write(&[frame(0x200, &[4])], Timeout::Millis(100))
        .await
        .unwrap();
    assert_eq!(2, objects.take_objects(&mut buf).unwrap());
    assert_eq!(&[4], buf[1].data());

    let mut one = [CanMessage::default(); 1];
    assert_eq!(Err(DriverError::NotSupported), objects.take(&mut one));
    assert_eq!(Err(DriverError::NotSupported), sender.take_objects(&mut one));
}

#[serial]
#[tokio::test]
async fn test_scheduled_frames_leave_at_their_due_time() {
    init_logging();
    let registry = Registry::new();
    let (card, _controller) = loopback_card(&registry, "SE000008", 0);

    let reader = registry.open(0, OpenParams::default()).unwrap();
    reader.id_region_add(CanId::std(0x300), 2).unwrap();
    let scheduler = registry
        .open(0, OpenParams::new(ModeFlags::SCHEDULED_TX))
        .unwrap();

    let timers = card.timers().clone();
    let freq = timers.frequency();
    let start = timers.now();
    let mut late = frame(0x300, &[1]);
    late.timestamp = start.saturating_add(duration_to_ticks(Duration::from_millis(40), freq));
    let mut early = frame(0x301, &[2]);
    early.timestamp = start.saturating_add(duration_to_ticks(Duration::from_millis(20), freq));

    assert_eq!(2, scheduler.send_t(&[late, early]).unwrap());
    assert_eq!(0, card.node(0).unwrap().bus_statistics().xmit_count.std_data);

    let mut buf = [CanMessage::default(); 2];
    let mut got = 0;
    while got < 2 {
        let done = reader
            .read_t(&mut buf[got..], Timeout::Millis(500))
            .await
            .unwrap();
        got += done.count;
    }
    assert_eq!(CanId::std(0x301), buf[0].id);
    assert_eq!(CanId::std(0x300), buf[1].id);
    assert_ge!(buf[0].timestamp, early.timestamp);
    assert_ge!(buf[1].timestamp, late.timestamp);
    assert_lt!(buf[0].timestamp, buf[1].timestamp);
}

#[serial]
#[tokio::test]
async fn test_modes_need_card_features() {
    init_logging();
    let registry = Registry::new();
    registry
        .attach(
            card_config_with("SE000009", 0, 1, &["can_20b", "busmaster"], ""),
            Arc::new(LoopbackController::new()),
            None,
        )
        .unwrap();

    for mode in [
        ModeFlags::LOCAL_ECHO,
        ModeFlags::OBJECT,
        ModeFlags::SCHEDULED_TX,
        ModeFlags::LISTEN_ONLY,
        ModeFlags::FD,
    ] {
        assert_eq!(
            Err(DriverError::NotSupported),
            registry.open(0, OpenParams::new(mode)).map(|_| ())
        );
    }
    assert!(registry.open(0, OpenParams::default()).is_ok());
    assert_eq!(
        Err(DriverError::InvalidParameter {
            reason: "queue size too large"
        }),
        registry
            .open(0, OpenParams::default().with_queues(0x10000, 0))
            .map(|_| ())
    );
}

#[serial]
#[tokio::test]
async fn test_write_timeout_reports_controller_state() {
    init_logging();
    let registry = Registry::new();
    let (_card, controller) = loopback_card(&registry, "SE000010", 0);
    controller.set_paused(true);
    let session = registry.open(0, OpenParams::default()).unwrap();
    let node = session.node().clone();

    let pattern = InjectionPattern::new(&[0x00], 6).unwrap();
    for _ in 0..12 {
        controller.inject_error(0, &pattern).unwrap();
    }
    assert!(wait_for(100, || node.bus_state() == BusState::Warn).await);
    assert_eq!(
        Err(DriverError::ControllerWarn),
        session.write(&[frame(0x40, &[1])], Timeout::Millis(20)).await
    );

    for _ in 0..5 {
        controller.inject_error(0, &pattern).unwrap();
    }
    assert!(wait_for(100, || node.bus_state() == BusState::ErrorPassive).await);
    assert_eq!(
        Err(DriverError::ControllerErrorPassive),
        session.write(&[frame(0x40, &[2])], Timeout::Millis(20)).await
    );

}
