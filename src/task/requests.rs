//! Request bridge
//!
//! The web front end runs on the network co-processor and forwards its HTTP calls over UART1, one
//! request per line. Each line is answered by one JSON line, see [`tank_core::service`] for the
//! commands.

use defmt::{debug, info, warn};
use embassy_rp::uart::{self, Uart};
use tank_core::{LineReader, RequestService};

use crate::system::activity;
use crate::system::resources::{BridgeResources, Irqs};
use crate::system::state::{CALIBRATION, CONFIG, MEASUREMENT, PUBLISH_GATE};
use crate::task::modem::Modem;
use crate::task::settings_storage::FlashSettings;

/// Longest accepted request line, room for a `SET_CONFIG` with every key
const REQUEST_CAPACITY: usize = 256;

#[embassy_executor::task]
pub async fn requests(r: BridgeResources) {
    let uart = Uart::new(
        r.uart,
        r.tx_pin,
        r.rx_pin,
        Irqs,
        r.tx_dma,
        r.rx_dma,
        uart::Config::default(),
    );
    let (mut tx, mut rx) = uart.split();
    let mut service = RequestService::new(
        &MEASUREMENT,
        &CALIBRATION,
        &CONFIG,
        &PUBLISH_GATE,
        FlashSettings,
        Modem,
        activity::signal_activity,
    );
    info!("Request bridge started");

    let mut reader: LineReader<REQUEST_CAPACITY> = LineReader::new();
    let mut byte = [0u8; 1];
    loop {
        if let Err(e) = rx.read(&mut byte).await {
            warn!("bridge read failed: {:?}", e);
            reader.reset();
            continue;
        }

        let Some(request) = reader.push(byte[0]) else {
            continue;
        };
        debug!("request: {}", request.as_str());
        let mut response = service.handle_line(&request).await;
        let _ = response.push('\n');
        if tx.write(response.as_bytes()).await.is_err() {
            warn!("bridge write failed");
        }
    }
}
