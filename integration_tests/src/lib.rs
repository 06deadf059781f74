pub mod sim_bus;
pub mod utils;

pub mod prelude {
    pub use super::sim_bus::{SimBus, SimBusReceiver, SimController};
    pub use super::utils::{
        card_config, card_config_with, frame, loopback_card, wait_for, ALL_FEATURES,
    };
    pub use esdcan_common::{
        baud::BaudSetting, bus_status::BusState, flags::ModeFlags, CanId, CanMessage, DriverError,
        StatusCode, Timeout,
    };
    pub use esdcan_driver::{
        Card, Completion, IoStatus, LoopbackController, OpenParams, Registry, RxState, Session,
        TxState,
    };
}
