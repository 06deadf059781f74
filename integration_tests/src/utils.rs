#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use esdcan_common::{card_config::CardConfig, CanId, CanMessage};
use esdcan_driver::{Card, LoopbackController, Registry};

/// Every feature the loopback setups advertise, except CAN-FD
pub const ALL_FEATURES: &[&str] = &[
    "can_20b",
    "timestamp",
    "busmaster",
    "scheduling",
    "rx_object_mode",
    "listen_only_mode",
    "local_echo",
    "smart_id_filter",
    "error_injection",
];

/// A card configuration with `nodes` classic channels at 500 kbit/s and every feature
pub fn card_config(serial: &str, base_net: u8, nodes: usize) -> CardConfig {
    card_config_with(serial, base_net, nodes, ALL_FEATURES, "")
}

/// Like [`card_config`], with a chosen feature list and extra top level keys
pub fn card_config_with(
    serial: &str,
    base_net: u8,
    nodes: usize,
    features: &[&str],
    extra: &str,
) -> CardConfig {
    let features = features
        .iter()
        .map(|f| format!("\"{f}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let mut toml = format!(
        r#"
        name = "CAN-PCIe/402-sim"
        serial = "{serial}"
        hardware_version = "1.2.0"
        firmware_version = "2.5.1"
        base_net = {base_net}
        features = [{features}]
        eei_units = 2
        {extra}

        [queues]
        rx = 64
        tx = 32
        "#
    );
    for _ in 0..nodes {
        toml.push_str(
            r#"
        [[node]]
        ctrl_type = "loopback"
        clock = 80000000
        transceiver = "high_speed"
        baud = 2
        "#,
        );
    }
    CardConfig::load_from_str(&toml).unwrap()
}

/// Attach a single node card backed by a loopback controller
pub fn loopback_card(
    registry: &Registry,
    serial: &str,
    base_net: u8,
) -> (Arc<Card>, Arc<LoopbackController>) {
    let controller = Arc::new(LoopbackController::new());
    let card = registry
        .attach(card_config(serial, base_net, 1), controller.clone(), None)
        .unwrap();
    (card, controller)
}

/// A classic data frame with an 11-bit identifier
pub fn frame(id: u16, data: &[u8]) -> CanMessage {
    CanMessage::new(CanId::std(id), data).unwrap()
}

/// Poll `cond` until it holds or `timeout_ms` passes. Returns the last result.
pub async fn wait_for(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return cond();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
