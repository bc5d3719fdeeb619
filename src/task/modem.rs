//! Network co-processor link
//!
//! The radio lives on a co-processor behind UART0. It speaks a line protocol, every command is
//! answered by one line, `OK` or `ERR <reason>`:
//!
//! ```text
//! NET UP <timeout_ms>    join the configured network
//! NET DOWN               leave it
//! PUB <json>             publish one measurement to the broker (connect, send, disconnect)
//! ```
//!
//! The task owns the UART. Other tasks go through the [`Modem`] handle, which serializes
//! requests and implements the core's network and publisher traits.

use core::fmt::Write as _;

use defmt::{debug, info, warn, Format};
use embassy_futures::select::select;
use embassy_rp::gpio::{Input, Pull};
use embassy_rp::uart::{self, Uart};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, mutex::Mutex, signal::Signal};
use embassy_time::{with_timeout, Duration, Timer};
use heapless::String;
use portable_atomic::{AtomicBool, Ordering};
use tank_core::publish::PAYLOAD_CAPACITY;
use tank_core::{LinkStatus, MeasurementPayload, Network, NetworkError, PublishError, Publisher};

use crate::system::event::{self, Events, EVENT_CHANNEL};
use crate::system::resources::{AccessPointResources, Irqs, ModemResources};

/// Longest line exchanged with the co-processor
const LINE_CAPACITY: usize = PAYLOAD_CAPACITY + 8;

/// Reply time on top of the command's own timeout
const REPLY_MARGIN: Duration = Duration::from_millis(500);

/// Reply time for commands without their own timeout
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

static REQUESTS: Channel<CriticalSectionRawMutex, ModemRequest, 1> = Channel::new();
static REPLY: Signal<CriticalSectionRawMutex, bool> = Signal::new();

/// One request/reply exchange at a time
static EXCLUSIVE: Mutex<CriticalSectionRawMutex, ()> = Mutex::new(());

/// Station link, changes are reported without waiting on the event queue
static LINK: LinkStatus = LinkStatus::new();
static ACCESS_POINT: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Format)]
enum ModemRequest {
    LinkUp(Duration),
    LinkDown,
    Publish(String<PAYLOAD_CAPACITY>),
}

impl ModemRequest {
    fn line(&self) -> String<LINE_CAPACITY> {
        let mut line = String::new();
        let _ = match self {
            Self::LinkUp(timeout) => writeln!(line, "NET UP {}", timeout.as_millis()),
            Self::LinkDown => writeln!(line, "NET DOWN"),
            Self::Publish(json) => writeln!(line, "PUB {}", json),
        };
        line
    }

    fn reply_timeout(&self) -> Duration {
        match self {
            Self::LinkUp(timeout) => *timeout + REPLY_MARGIN,
            Self::LinkDown => REPLY_MARGIN,
            Self::Publish(_) => PUBLISH_TIMEOUT,
        }
    }
}

/// Handle to the co-processor
#[derive(Clone, Copy)]
pub struct Modem;

impl Modem {
    async fn request(&self, request: ModemRequest) -> bool {
        let _exclusive = EXCLUSIVE.lock().await;
        REPLY.reset();
        REQUESTS.send(request).await;
        REPLY.wait().await
    }
}

impl Network for Modem {
    async fn connect(&self, timeout: Duration) -> Result<(), NetworkError> {
        if LINK.is_up() {
            return Ok(());
        }
        if self.request(ModemRequest::LinkUp(timeout)).await {
            set_link(true);
            Ok(())
        } else {
            Err(NetworkError::Unavailable)
        }
    }

    async fn disconnect(&self) {
        self.request(ModemRequest::LinkDown).await;
        set_link(false);
    }

    fn is_connected(&self) -> bool {
        LINK.is_up()
    }

    fn access_point_active(&self) -> bool {
        ACCESS_POINT.load(Ordering::Acquire)
    }
}

impl Publisher for Modem {
    async fn publish(&self, payload: &MeasurementPayload) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Connect);
        }
        if self.request(ModemRequest::Publish(payload.to_json())).await {
            Ok(())
        } else {
            Err(PublishError::Send)
        }
    }
}

/// The orchestrator disconnects on its way to sleep, so this must not wait on its own queue
fn set_link(up: bool) {
    LINK.set(up, &EVENT_CHANNEL, Events::LinkChanged);
}

/// Modem task
///
/// Forwards each request as one line and reports whether the co-processor acknowledged it.
#[embassy_executor::task]
pub async fn modem(r: ModemResources) {
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
    info!("Modem link started");

    loop {
        let request = REQUESTS.receive().await;
        debug!("modem request: {:?}", request);

        if tx.write(request.line().as_bytes()).await.is_err() {
            warn!("modem write failed");
            REPLY.signal(false);
            continue;
        }

        let mut reply: String<LINE_CAPACITY> = String::new();
        let read_line = async {
            let mut byte = [0u8; 1];
            loop {
                rx.read(&mut byte).await.map_err(|_| ())?;
                match byte[0] {
                    b'\n' => break Ok::<(), ()>(()),
                    b'\r' => {}
                    b => reply.push(b as char).map_err(|_| ())?,
                }
            }
        };
        let acknowledged = match with_timeout(request.reply_timeout(), read_line).await {
            Ok(Ok(())) => reply.as_str() == "OK",
            Ok(Err(())) => false,
            Err(_) => {
                warn!("modem reply timed out");
                false
            }
        };
        if !acknowledged {
            warn!("modem refused: {}", reply.as_str());
        }
        REPLY.signal(acknowledged);
    }
}

/// Access point status watcher
///
/// The co-processor drives the status line high while it serves its own access point.
#[embassy_executor::task]
pub async fn access_point_watch(r: AccessPointResources) {
    let mut status = Input::new(r.status_pin, Pull::Down);

    loop {
        let active = status.is_high();
        if ACCESS_POINT.swap(active, Ordering::AcqRel) != active {
            event::send(Events::AccessPointChanged(active)).await;
        }

        // edges can be missed while the event is queued, poll as a fallback
        select(status.wait_for_any_edge(), Timer::after_secs(5)).await;
    }
}
