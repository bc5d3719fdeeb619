//! Tank level node firmware entry point
//!
//! Works out why the chip is running, loads the settings and then either takes a periodic
//! measurement and goes back to sleep, or starts the interactive session.

#![no_std]
#![no_main]

use crate::system::state::{CALIBRATION, CONFIG, MEASUREMENT, PUBLISH_GATE, SYSTEM_STATE};
use crate::task::{
    level_indicate::level_indicate,
    modem::{access_point_watch, modem, Modem},
    orchestrate::orchestrate,
    power::{self, Platform},
    publish_periodic::publish_periodic,
    requests::requests,
    sample::{self, sample},
    settings_storage::{settings_storage, FlashSettings},
    track_inactivity::track_inactivity,
};
use defmt::{error, info};
use embassy_executor::Spawner;
use embassy_rp::block::ImageDef;
use embassy_rp::config::Config;
use embassy_time::{Delay, Instant};
use system::resources::{
    AccessPointResources, AssignedResources, BridgeResources, DistanceSensorResources, ModemResources,
    PowerResources, RGBLedResources, SettingsResources,
};
use tank_core::power::{enter_sleep, run_periodic_cycle};
use tank_core::{Calibration, PowerLifecycle, PowerState, RuntimeConfig, SleepPlan};
use {defmt_rtt as _, panic_probe as _};

/// Firmware image type for bootloader
#[link_section = ".start_block"]
#[used]
pub static IMAGE_DEF: ImageDef = ImageDef::secure_exe();

/// System core modules
mod system;
/// Task implementations
mod task;

/// Firmware entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Config::default());

    // Split the resources into separate groups for each task
    let r = split_resources!(p);

    // Continues an unfinished deep sleep before anything else runs
    let cause = power::init(r.power);

    spawner.spawn(settings_storage(r.settings)).unwrap();
    spawner.spawn(modem(r.modem)).unwrap();
    spawner.spawn(access_point_watch(r.access_point)).unwrap();

    let mut store = FlashSettings;
    let config = RuntimeConfig::load(&mut store).await;
    CALIBRATION.set(Calibration::load(&mut store).await);
    CONFIG.set(config);
    PUBLISH_GATE.set_enabled(config.publish_enabled);
    info!("config: {:?}", config);

    let mut lifecycle = PowerLifecycle::on_wake(cause, &config, Instant::now());

    let Some(mut pipeline) = sample::pipeline(r.distance_sensor, &config) else {
        error!("measurement writer already taken");
        match enter_sleep(&Modem, &mut Platform, SleepPlan::from_config(&config)).await {}
    };

    if lifecycle.state() == PowerState::PeriodicMeasure {
        let plan = run_periodic_cycle(
            &mut lifecycle,
            &mut pipeline,
            &CALIBRATION,
            &mut Delay,
            &Modem,
            &Modem,
            &PUBLISH_GATE,
            &MEASUREMENT,
            &config,
        )
        .await;
        match enter_sleep(&Modem, &mut Platform, plan).await {}
    }

    lifecycle.boot_complete(Instant::now());
    {
        let mut state = SYSTEM_STATE.lock().await;
        state.power = Some(lifecycle);
    }

    spawner.spawn(orchestrate()).unwrap();
    spawner.spawn(sample(pipeline)).unwrap();
    spawner.spawn(level_indicate(r.rgb_led)).unwrap();
    spawner.spawn(requests(r.bridge)).unwrap();
    spawner.spawn(publish_periodic()).unwrap();
    spawner.spawn(track_inactivity()).unwrap();
}
