use std::sync::Arc;
use std::time::Duration;

use esdcan_driver::eei::{EeiConfig, EeiState, EeiTrigger, InjectionPattern};
use esdcan_driver::{Driver, IoctlCmd, Reply, Request, Response};
use integration_tests::prelude::*;
use serial_test::serial;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn create(driver: &Driver, net: u8, mode: ModeFlags) -> u32 {
    let reply = driver
        .ioctl(
            0,
            Request::CreateSession {
                net,
                params: OpenParams::new(mode)
                    .with_timeouts(Timeout::Millis(100), Timeout::Millis(100)),
            },
        )
        .await;
    assert_eq!(StatusCode::Success, reply.status);
    match reply.data {
        Response::Handle(h) => h,
        other => panic!("Unexpected response {other:?}"),
    }
}

fn ok(data: Response) -> Reply {
    Reply {
        status: StatusCode::Success,
        data,
    }
}

#[serial]
#[tokio::test]
async fn test_session_lifecycle() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    let (_card, _controller) = loopback_card(driver.registry(), "IO000001", 0);

    let h = create(&driver, 0, ModeFlags::LOCAL_ECHO).await;
    assert_eq!(
        ok(Response::Timeouts {
            rx: Timeout::Millis(100),
            tx: Timeout::Millis(100)
        }),
        driver.ioctl(h, Request::GetTimeouts).await
    );
    assert_eq!(ok(Response::Baud(2)), driver.ioctl(h, Request::GetBaud).await);
    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::IdAdd(CanId::std(0x72))).await
    );
    assert_eq!(
        StatusCode::IdAlreadyEnabled,
        driver.ioctl(h, Request::IdAdd(CanId::std(0x72))).await.status
    );

    let frames = [frame(0x72, &[1]), frame(0x72, &[2])];
    assert_eq!(
        ok(Response::Completed(Completion {
            count: 2,
            status: IoStatus::Success
        })),
        driver.ioctl(h, Request::Write(&frames)).await
    );

    let mut buf = [CanMessage::default(); 4];
    let reply = driver.ioctl(h, Request::Read(&mut buf)).await;
    assert_eq!(StatusCode::IoIncomplete, reply.status);
    assert_eq!(
        Response::Completed(Completion {
            count: 2,
            status: IoStatus::Partial
        }),
        reply.data
    );
    assert_eq!(&[2], buf[1].data());

    let reply = driver.ioctl(h, Request::Read(&mut buf)).await;
    assert_eq!(StatusCode::RxTimeout, reply.status);
    assert_eq!(0xE000_0001, reply.code());

    match driver.ioctl(h, Request::GetBusStatistic).await.data {
        Response::Statistics(stats) => assert_eq!(2, stats.xmit_count.std_data),
        other => panic!("Unexpected response {other:?}"),
    }
    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::ResetBusStatistic).await
    );
    match driver.ioctl(h, Request::GetBusStatistic).await.data {
        Response::Statistics(stats) => assert_eq!(0, stats.xmit_count.std_data),
        other => panic!("Unexpected response {other:?}"),
    }

    match driver.ioctl(h, Request::GetDeviceInfo).await.data {
        Response::DeviceInfo(info) => {
            assert_eq!(0, info.net);
            assert_eq!(1, info.open_handles);
            assert_eq!(80_000_000, info.timestamp_freq);
        }
        other => panic!("Unexpected response {other:?}"),
    }
    assert_eq!(
        ok(Response::Frequency(80_000_000)),
        driver.ioctl(h, Request::GetTimestampFreq).await
    );

    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::DestroySession).await
    );
    assert_eq!(
        StatusCode::InvalidHandle,
        driver.ioctl(h, Request::GetBaud).await.status
    );
}

#[serial]
#[tokio::test]
async fn test_raw_command_numbers() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    let (_card, _controller) = loopback_card(driver.registry(), "IO000002", 0);
    let h = create(&driver, 0, ModeFlags::empty()).await;

    assert_eq!(
        ok(Response::Baud(2)),
        driver
            .ioctl_raw(h, IoctlCmd::GetBaud.into(), Request::GetBaud)
            .await
    );
    assert_eq!(
        StatusCode::NotImplemented,
        driver.ioctl_raw(h, 999, Request::GetBaud).await.status
    );
    assert_eq!(
        StatusCode::NotImplemented,
        driver
            .ioctl_raw(h, IoctlCmd::SetBaud.into(), Request::GetBaud)
            .await
            .status
    );

    // Baudrate words go through unchanged
    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::SetBaud(0x2000_0000 | 250_000)).await
    );
    assert_eq!(
        ok(Response::Baud(0x2000_0000 | 250_000)),
        driver.ioctl(h, Request::GetBaud).await
    );
    assert_eq!(
        StatusCode::InvalidParameter,
        driver.ioctl(h, Request::SetBaud(0x55)).await.status
    );
    // Data phase rates need an FD channel
    assert_eq!(
        StatusCode::NotSupported,
        driver
            .ioctl(
                h,
                Request::SetBaudX {
                    nominal: 2,
                    data: 0
                }
            )
            .await
            .status
    );
}

#[serial]
#[tokio::test]
async fn test_write_timeout_reports_completed_count() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    let (_card, controller) = loopback_card(driver.registry(), "IO000003", 0);
    let h = create(&driver, 0, ModeFlags::empty()).await;

    controller.set_paused(true);
    let reply = driver
        .ioctl(h, Request::Write(&[frame(0x10, &[1])]))
        .await;
    assert_eq!(StatusCode::TxTimeout, reply.status);
    assert_eq!(Response::Count(0), reply.data);
    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::AbortTx).await
    );
}

#[serial]
#[tokio::test]
async fn test_error_injection_units() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    let (_card, controller) = loopback_card(driver.registry(), "IO000004", 0);
    let h = create(&driver, 0, ModeFlags::empty()).await;

    let unit = match driver.ioctl(h, Request::EeiCreate).await.data {
        Response::Eei(id) => id,
        other => panic!("Unexpected response {other:?}"),
    };
    let second = driver.ioctl(h, Request::EeiCreate).await;
    assert_eq!(StatusCode::Success, second.status);
    // The card has two units
    assert_eq!(
        StatusCode::InsufficientResources,
        driver.ioctl(h, Request::EeiCreate).await.status
    );

    // Starting needs a configuration
    assert_eq!(
        StatusCode::InvalidParameter,
        driver.ioctl(h, Request::EeiStart(unit)).await.status
    );
    let config = EeiConfig {
        trigger: EeiTrigger::Manual,
        pattern: InjectionPattern::new(&[0x00], 6).unwrap(),
        delay: Duration::ZERO,
        repeat: 2,
    };
    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::EeiConfigure(unit, config)).await
    );
    assert_eq!(ok(Response::None), driver.ioctl(h, Request::EeiStart(unit)).await);
    for _ in 0..2 {
        assert_eq!(
            ok(Response::None),
            driver.ioctl(h, Request::EeiTriggerNow(unit)).await
        );
    }
    assert_eq!(2, controller.injected(0));
    match driver.ioctl(h, Request::EeiStatus(unit)).await.data {
        Response::EeiStatus(status) => {
            assert_eq!(2, status.fired);
            assert_eq!(EeiState::Stopped, status.state);
        }
        other => panic!("Unexpected response {other:?}"),
    }

    // Injected errors show up in the error counters
    assert!(
        wait_for(100, || {
            driver
                .registry()
                .node(0)
                .is_ok_and(|n| n.error_counters().tec == 16)
        })
        .await
    );

    assert_eq!(
        ok(Response::None),
        driver.ioctl(h, Request::EeiDestroy(unit)).await
    );
    assert_eq!(
        StatusCode::InvalidHandle,
        driver.ioctl(h, Request::EeiStatus(unit)).await.status
    );
}

#[serial]
#[tokio::test]
async fn test_error_injection_units_stay_with_their_net() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    driver
        .registry()
        .attach(
            card_config("IO000008", 0, 2),
            Arc::new(LoopbackController::new()),
            None,
        )
        .unwrap();
    let owner = create(&driver, 0, ModeFlags::empty()).await;
    let other = create(&driver, 1, ModeFlags::empty()).await;

    let unit = match driver.ioctl(owner, Request::EeiCreate).await.data {
        Response::Eei(id) => id,
        other => panic!("Unexpected response {other:?}"),
    };
    let config = EeiConfig {
        trigger: EeiTrigger::Manual,
        pattern: InjectionPattern::new(&[0x00], 6).unwrap(),
        delay: Duration::ZERO,
        repeat: 0,
    };
    assert_eq!(
        StatusCode::InvalidHandle,
        driver
            .ioctl(other, Request::EeiConfigure(unit, config.clone()))
            .await
            .status
    );
    assert_eq!(
        ok(Response::None),
        driver.ioctl(owner, Request::EeiConfigure(unit, config)).await
    );
    assert_eq!(ok(Response::None), driver.ioctl(owner, Request::EeiStart(unit)).await);

    for req in [
        Request::EeiStop(unit),
        Request::EeiTriggerNow(unit),
        Request::EeiStatus(unit),
        Request::EeiDestroy(unit),
    ] {
        assert_eq!(
            StatusCode::InvalidHandle,
            driver.ioctl(other, req).await.status
        );
    }

    // Still usable from its own net
    match driver.ioctl(owner, Request::EeiStatus(unit)).await.data {
        Response::EeiStatus(status) => assert_eq!(EeiState::Running, status.state),
        other => panic!("Unexpected response {other:?}"),
    }
    assert_eq!(
        ok(Response::None),
        driver.ioctl(owner, Request::EeiDestroy(unit)).await
    );
}

#[serial]
#[tokio::test]
async fn test_error_injection_needs_the_feature() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    driver
        .registry()
        .attach(
            card_config_with("IO000005", 0, 1, &["can_20b"], ""),
            Arc::new(LoopbackController::new()),
            None,
        )
        .unwrap();
    let h = create(&driver, 0, ModeFlags::empty()).await;
    assert_eq!(
        StatusCode::NotSupported,
        driver.ioctl(h, Request::EeiCreate).await.status
    );
}

#[serial]
#[tokio::test]
async fn test_outdated_firmware_disables_the_card() {
    init_logging();
    let driver = Driver::new(Arc::new(Registry::new()));
    driver
        .registry()
        .attach(
            card_config_with(
                "IO000006",
                0,
                1,
                integration_tests::utils::ALL_FEATURES,
                "min_firmware_version = \"3.0.0\"",
            ),
            Arc::new(LoopbackController::new()),
            None,
        )
        .unwrap();

    let reply = driver
        .ioctl(
            0,
            Request::CreateSession {
                net: 0,
                params: OpenParams::default(),
            },
        )
        .await;
    assert_eq!(StatusCode::InvalidFirmware, reply.status);

    let reply = driver
        .ioctl(
            0,
            Request::CreateSession {
                net: 7,
                params: OpenParams::default(),
            },
        )
        .await;
    assert_eq!(StatusCode::NetNotFound, reply.status);
}
