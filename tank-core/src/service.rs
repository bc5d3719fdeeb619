//! Requests from the web front end
//!
//! One request per line, one JSON body per answer.
//!
//! | request                          | answer                                           |
//! |----------------------------------|--------------------------------------------------|
//! | `DISTANCE`                       | latest measurement and the tank references       |
//! | `CALIBS`                         | the three calibration points                     |
//! | `SAVE_CALIB <id> <height>`       | captures the current measurement as point `id`   |
//! | `CLEAR_CALIB`                    | forgets all points                               |
//! | `SET_CUVE [vide=<cm>] [pleine=<cm>]` | updates the tank references                  |
//! | `CONFIG`                         | every runtime setting by its store key           |
//! | `SET_CONFIG <key>=<value>...`    | changes, persists and applies settings           |
//! | `SEND`                           | connects and publishes now, through the shared gate |
//!
//! Commands answer `{"ok":true}` or `{"ok":false,"err":"<reason>"}`. Every request, even a
//! malformed one, counts as a user interaction.

use core::fmt::Write;

use heapless::String;

use crate::calibration::{CalibrationError, POINT_COUNT};
use crate::config::{ConfigUpdate, InvalidSetting, Setting, SettingValue};
use crate::power::{publish_once, Network};
use crate::publish::{write_decimal, PublishError, PublishGate, Publisher};
use crate::state::{SharedCalibration, SharedConfig, SharedMeasurement};
use crate::storage::SettingsStore;

/// Room for the longest answer
pub const RESPONSE_CAPACITY: usize = 512;

pub type Response = String<RESPONSE_CAPACITY>;

/// Malformed requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestError {
    Empty,
    Unknown,
    MissingArgument,
    InvalidNumber,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    Distance,
    Calibrations,
    SaveCalibration { index: usize, height_cm: f32 },
    ClearCalibration,
    SetTankLevels { empty_cm: Option<f32>, full_cm: Option<f32> },
    Config,
    SetConfig(ConfigUpdate),
    Send,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let mut words = line.split_ascii_whitespace();
        let command = words.next().ok_or(RequestError::Empty)?;

        let request = if command.eq_ignore_ascii_case("DISTANCE") {
            Self::Distance
        } else if command.eq_ignore_ascii_case("CALIBS") {
            Self::Calibrations
        } else if command.eq_ignore_ascii_case("SAVE_CALIB") {
            let index = words.next().ok_or(RequestError::MissingArgument)?;
            let height = words.next().ok_or(RequestError::MissingArgument)?;
            Self::SaveCalibration {
                index: index.parse().map_err(|_| RequestError::InvalidNumber)?,
                height_cm: number(height)?,
            }
        } else if command.eq_ignore_ascii_case("CLEAR_CALIB") {
            Self::ClearCalibration
        } else if command.eq_ignore_ascii_case("SET_CUVE") {
            let mut empty_cm = None;
            let mut full_cm = None;
            for arg in words.by_ref() {
                match arg.split_once('=') {
                    Some(("vide", v)) => empty_cm = Some(number(v)?),
                    Some(("pleine", v)) => full_cm = Some(number(v)?),
                    _ => return Err(RequestError::Unknown),
                }
            }
            Self::SetTankLevels { empty_cm, full_cm }
        } else if command.eq_ignore_ascii_case("CONFIG") {
            Self::Config
        } else if command.eq_ignore_ascii_case("SET_CONFIG") {
            let mut update = ConfigUpdate::default();
            for arg in words.by_ref() {
                let (key, value) = arg.split_once('=').ok_or(RequestError::Unknown)?;
                let setting = Setting::from_key(key).ok_or(RequestError::Unknown)?;
                update.set(setting, number(value)?);
            }
            if update.is_empty() {
                return Err(RequestError::MissingArgument);
            }
            Self::SetConfig(update)
        } else if command.eq_ignore_ascii_case("SEND") {
            Self::Send
        } else {
            return Err(RequestError::Unknown);
        };

        if words.next().is_some() {
            return Err(RequestError::Unknown);
        }
        Ok(request)
    }
}

fn number(word: &str) -> Result<f32, RequestError> {
    word.parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or(RequestError::InvalidNumber)
}

/// Cuts a byte stream into request lines
///
/// `\r` is dropped. A line longer than `N` comes out empty, so it is answered as unparseable
/// instead of being cut into a different request.
pub struct LineReader<const N: usize> {
    line: String<N>,
    overflow: bool,
}

impl<const N: usize> LineReader<N> {
    pub const fn new() -> Self {
        Self {
            line: String::new(),
            overflow: false,
        }
    }

    /// Takes one byte, returns the line once it is complete
    pub fn push(&mut self, byte: u8) -> Option<String<N>> {
        match byte {
            b'\r' => None,
            b'\n' => {
                let line = core::mem::take(&mut self.line);
                let overflow = core::mem::replace(&mut self.overflow, false);
                Some(if overflow { String::new() } else { line })
            }
            b => {
                if self.line.push(b as char).is_err() {
                    self.overflow = true;
                }
                None
            }
        }
    }

    /// Forgets the partial line, e.g. after a transport error
    pub fn reset(&mut self) {
        self.line.clear();
        self.overflow = false;
    }
}

impl<const N: usize> Default for LineReader<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves requests against the shared state
///
/// `link` is both the station network and the broker connection, `SEND` brings it up first.
pub struct RequestService<'a, St, L, T> {
    measurement: &'a SharedMeasurement,
    calibration: &'a SharedCalibration,
    config: &'a SharedConfig,
    gate: &'a PublishGate,
    store: St,
    link: L,
    on_interaction: T,
}

impl<'a, St, L, T> RequestService<'a, St, L, T>
where
    St: SettingsStore,
    L: Network + Publisher,
    T: FnMut(),
{
    pub fn new(
        measurement: &'a SharedMeasurement,
        calibration: &'a SharedCalibration,
        config: &'a SharedConfig,
        gate: &'a PublishGate,
        store: St,
        link: L,
        on_interaction: T,
    ) -> Self {
        Self {
            measurement,
            calibration,
            config,
            gate,
            store,
            link,
            on_interaction,
        }
    }

    /// Parses and answers one request line
    pub async fn handle_line(&mut self, line: &str) -> Response {
        (self.on_interaction)();
        match Request::parse(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!("bad request: {:?}", e);
                failure("bad request")
            }
        }
    }

    pub async fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Distance => self.distance(),
            Request::Calibrations => self.calibrations(),
            Request::SaveCalibration { index, height_cm } => {
                let measured = self.measurement.snapshot().measured_cm;
                let mut calibration = self.calibration.get();
                match calibration.save_point(&mut self.store, index, measured, height_cm).await {
                    Ok(_) => {
                        self.calibration.set(calibration);
                        success()
                    }
                    Err(e) => calibration_failure(e),
                }
            }
            Request::ClearCalibration => {
                let mut calibration = self.calibration.get();
                match calibration.clear(&mut self.store).await {
                    Ok(()) => {
                        self.calibration.set(calibration);
                        success()
                    }
                    Err(e) => calibration_failure(e),
                }
            }
            Request::SetTankLevels { empty_cm, full_cm } => {
                let mut calibration = self.calibration.get();
                match calibration.set_tank_levels(&mut self.store, empty_cm, full_cm).await {
                    Ok(_) => {
                        self.calibration.set(calibration);
                        success()
                    }
                    Err(e) => calibration_failure(e),
                }
            }
            Request::Config => self.settings(),
            Request::SetConfig(update) => self.reconfigure(update).await,
            Request::Send => {
                let config = self.config.get();
                match publish_once(&self.link, &self.link, self.gate, self.measurement, &config).await {
                    Ok(()) => success(),
                    Err(PublishError::Busy) => failure("busy"),
                    Err(e) => {
                        warn!("send failed: {:?}", e);
                        failure("publish")
                    }
                }
            }
        }
    }

    /// Persists first, so RAM never runs ahead of flash
    async fn reconfigure(&mut self, update: ConfigUpdate) -> Response {
        let config = match update.apply_to(self.config.get()) {
            Ok(config) => config.sanitized(),
            Err(InvalidSetting(setting)) => {
                warn!("{} rejected", setting.key());
                return failure("bad value");
            }
        };
        if let Err(e) = config.save(&mut self.store).await {
            warn!("saving config failed: {:?}", e);
            return failure("store");
        }
        self.config.set(config);
        self.gate.set_enabled(config.publish_enabled);
        info!("config updated, publishing {}", config.publish_enabled);
        success()
    }

    fn distance(&self) -> Response {
        let snapshot = self.measurement.snapshot();
        let levels = self.calibration.get().levels();

        let mut out = Response::new();
        let _ = out.push_str("{\"measured_cm\":");
        let _ = write_decimal(&mut out, snapshot.measured_cm, 2);
        let _ = out.push_str(",\"estimated_cm\":");
        let _ = write_decimal(&mut out, snapshot.estimated_height_cm, 2);
        let _ = write!(out, ",\"duration_us\":{},\"cuveVide\":", snapshot.last_duration_us);
        let _ = write_decimal(&mut out, Some(levels.empty_cm), 1);
        let _ = out.push_str(",\"cuvePleine\":");
        let _ = write_decimal(&mut out, Some(levels.full_cm), 1);
        let _ = out.push('}');
        out
    }

    fn calibrations(&self) -> Response {
        let calibration = self.calibration.get();

        let mut out = Response::new();
        let _ = out.push_str("{\"calibs\":[");
        for (i, point) in calibration.points().iter().enumerate() {
            let _ = write!(out, "{{\"index\":{},\"measured\":", i);
            let _ = write_decimal(&mut out, Some(point.measured_cm), 2);
            let _ = out.push_str(",\"height\":");
            let _ = write_decimal(&mut out, Some(point.height_cm), 2);
            let _ = out.push('}');
            if i + 1 < POINT_COUNT {
                let _ = out.push(',');
            }
        }
        let _ = out.push_str("]}");
        out
    }

    fn settings(&self) -> Response {
        let config = self.config.get();

        let mut out = Response::new();
        let _ = out.push('{');
        for (i, setting) in Setting::ALL.iter().enumerate() {
            if i > 0 {
                let _ = out.push(',');
            }
            let _ = write!(out, "\"{}\":", setting.key());
            let _ = match config.value(*setting) {
                SettingValue::Integer(v) => write!(out, "{}", v),
                SettingValue::Decimal(v) => write_decimal(&mut out, Some(v), 2),
                SettingValue::Flag(v) => write!(out, "{}", v),
            };
        }
        let _ = out.push('}');
        out
    }
}

fn success() -> Response {
    let mut out = Response::new();
    let _ = out.push_str("{\"ok\":true}");
    out
}

fn failure(reason: &str) -> Response {
    let mut out = Response::new();
    let _ = write!(out, "{{\"ok\":false,\"err\":\"{}\"}}", reason);
    out
}

fn calibration_failure(e: CalibrationError) -> Response {
    warn!("calibration request failed: {:?}", e);
    match e {
        CalibrationError::IndexOutOfRange => failure("bad index"),
        CalibrationError::NoMeasurement => failure("no echo"),
        CalibrationError::Store(_) => failure("store"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, RuntimeConfig};
    use crate::power::NetworkError;
    use crate::publish::MeasurementPayload;
    use crate::state::MeasurementSnapshot;
    use crate::storage::{MemoryStore, StoreError};
    use core::cell::Cell;
    use embassy_futures::block_on;
    use embassy_time::Duration;

    /// Station link and broker in one; starts disconnected and only publishes while up
    #[derive(Default)]
    struct FakeLink {
        connected: Cell<bool>,
        connects: Cell<u32>,
        published: Cell<u32>,
    }

    impl Network for FakeLink {
        async fn connect(&self, _timeout: Duration) -> Result<(), NetworkError> {
            self.connects.set(self.connects.get() + 1);
            self.connected.set(true);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.set(false);
        }
        fn is_connected(&self) -> bool {
            self.connected.get()
        }
        fn access_point_active(&self) -> bool {
            false
        }
    }

    impl Publisher for FakeLink {
        async fn publish(&self, _payload: &MeasurementPayload) -> Result<(), PublishError> {
            if !self.connected.get() {
                return Err(PublishError::Connect);
            }
            self.published.set(self.published.get() + 1);
            Ok(())
        }
    }

    /// Store whose writes always fail
    struct BrokenStore;

    impl SettingsStore for BrokenStore {
        async fn get_f32(&mut self, _key: &str) -> Result<Option<f32>, StoreError> {
            Err(StoreError::Backend)
        }
        async fn put_f32(&mut self, _key: &str, _value: f32) -> Result<(), StoreError> {
            Err(StoreError::Backend)
        }
        async fn get_u32(&mut self, _key: &str) -> Result<Option<u32>, StoreError> {
            Err(StoreError::Backend)
        }
        async fn put_u32(&mut self, _key: &str, _value: u32) -> Result<(), StoreError> {
            Err(StoreError::Backend)
        }
        async fn remove(&mut self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend)
        }
    }

    fn measure(state: &SharedMeasurement, measured_cm: Option<f32>) {
        if let Some(mut writer) = state.writer() {
            writer.publish(MeasurementSnapshot {
                measured_cm,
                estimated_height_cm: None,
                last_duration_us: measured_cm.map_or(0, |m| (m / crate::sensor::CM_PER_US) as u32),
            });
        }
    }

    #[test]
    fn parses_requests() {
        assert_eq!(Request::parse("DISTANCE"), Ok(Request::Distance));
        assert_eq!(Request::parse("  calibs \r"), Ok(Request::Calibrations));
        assert_eq!(
            Request::parse("SAVE_CALIB 1 87.5"),
            Ok(Request::SaveCalibration { index: 1, height_cm: 87.5 })
        );
        assert_eq!(
            Request::parse("SET_CUVE pleine=40"),
            Ok(Request::SetTankLevels { empty_cm: None, full_cm: Some(40.0) })
        );
        assert_eq!(
            Request::parse("SET_CUVE vide=120.5 pleine=40"),
            Ok(Request::SetTankLevels { empty_cm: Some(120.5), full_cm: Some(40.0) })
        );
        assert_eq!(Request::parse("SEND"), Ok(Request::Send));
        assert_eq!(Request::parse("CLEAR_CALIB"), Ok(Request::ClearCalibration));
        assert_eq!(Request::parse("config"), Ok(Request::Config));

        let mut update = ConfigUpdate::default();
        update.set(Setting::PublishEnabled, 1.0);
        update.set(Setting::MeasureOffset, -2.5);
        assert_eq!(
            Request::parse("SET_CONFIG pub_en=1 meas_off_cm=-2.5"),
            Ok(Request::SetConfig(update))
        );
    }

    #[test]
    fn rejects_malformed_requests() {
        assert_eq!(Request::parse(""), Err(RequestError::Empty));
        assert_eq!(Request::parse("REBOOT"), Err(RequestError::Unknown));
        assert_eq!(Request::parse("SAVE_CALIB 1"), Err(RequestError::MissingArgument));
        assert_eq!(Request::parse("SAVE_CALIB x 10"), Err(RequestError::InvalidNumber));
        assert_eq!(Request::parse("SAVE_CALIB 0 nan"), Err(RequestError::InvalidNumber));
        assert_eq!(Request::parse("SET_CUVE depth=3"), Err(RequestError::Unknown));
        assert_eq!(Request::parse("SEND now"), Err(RequestError::Unknown));
        assert_eq!(Request::parse("SET_CONFIG"), Err(RequestError::MissingArgument));
        assert_eq!(Request::parse("SET_CONFIG colour=3"), Err(RequestError::Unknown));
        assert_eq!(Request::parse("SET_CONFIG pub_en"), Err(RequestError::Unknown));
        assert_eq!(Request::parse("SET_CONFIG pub_en=yes"), Err(RequestError::InvalidNumber));
    }

    #[test]
    fn line_reader_recovers_after_errors() {
        fn feed(reader: &mut LineReader<8>, bytes: &[u8]) -> Option<String<8>> {
            bytes.iter().filter_map(|b| reader.push(*b)).last()
        }

        let mut reader: LineReader<8> = LineReader::new();

        assert_eq!(feed(&mut reader, b"CALIBS\r\n").as_deref(), Some("CALIBS"));

        // an overlong line is answered as an empty one
        assert_eq!(feed(&mut reader, b"SAVE_CALIB 0 50\n").as_deref(), Some(""));

        // a transport error in the middle of an overlong line
        assert_eq!(feed(&mut reader, b"SAVE_CALIB 0"), None);
        reader.reset();
        assert_eq!(feed(&mut reader, b"SEND\n").as_deref(), Some("SEND"));
    }

    #[test]
    fn distance_without_measurement() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(true);
        let mut service = RequestService::new(
            &state,
            &calibration,
            &config,
            &gate,
            MemoryStore::new(),
            FakeLink::default(),
            || {},
        );

        assert_eq!(
            block_on(service.handle_line("DISTANCE")).as_str(),
            r#"{"measured_cm":null,"estimated_cm":null,"duration_us":0,"cuveVide":123.0,"cuvePleine":42.0}"#
        );
    }

    #[test]
    fn calibrate_then_read_back() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(true);
        let touches = Cell::new(0);
        let mut service = RequestService::new(
            &state,
            &calibration,
            &config,
            &gate,
            MemoryStore::new(),
            FakeLink::default(),
            || touches.set(touches.get() + 1),
        );

        assert_eq!(
            block_on(service.handle_line("SAVE_CALIB 0 50")).as_str(),
            r#"{"ok":false,"err":"no echo"}"#
        );

        measure(&state, Some(25.0));
        assert_eq!(block_on(service.handle_line("SAVE_CALIB 2 150")).as_str(), r#"{"ok":true}"#);
        assert_eq!(
            block_on(service.handle_line("SAVE_CALIB 3 150")).as_str(),
            r#"{"ok":false,"err":"bad index"}"#
        );
        assert_eq!(
            block_on(service.handle_line("CALIBS")).as_str(),
            concat!(
                r#"{"calibs":[{"index":0,"measured":0.00,"height":50.00},"#,
                r#"{"index":1,"measured":0.00,"height":100.00},"#,
                r#"{"index":2,"measured":25.00,"height":150.00}]}"#
            )
        );
        assert_eq!(calibration.get().points()[2].measured_cm, 25.0);

        assert_eq!(block_on(service.handle_line("SET_CUVE vide=110")).as_str(), r#"{"ok":true}"#);
        assert_eq!(calibration.get().levels().empty_cm, 110.0);

        assert_eq!(block_on(service.handle_line("CLEAR_CALIB")).as_str(), r#"{"ok":true}"#);
        assert_eq!(calibration.get().points()[2].measured_cm, 0.0);

        assert_eq!(
            block_on(service.handle_line("bogus")).as_str(),
            r#"{"ok":false,"err":"bad request"}"#
        );
        assert_eq!(touches.get(), 7);
    }

    #[test]
    fn store_failure_leaves_calibration_untouched() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(true);
        let mut service =
            RequestService::new(&state, &calibration, &config, &gate, BrokenStore, FakeLink::default(), || {});

        measure(&state, Some(30.0));
        assert_eq!(
            block_on(service.handle_line("SAVE_CALIB 0 50")).as_str(),
            r#"{"ok":false,"err":"store"}"#
        );
        assert_eq!(calibration.get().points()[0].measured_cm, 0.0);
    }

    #[test]
    fn store_failure_keeps_the_running_config() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(false);
        let mut service =
            RequestService::new(&state, &calibration, &config, &gate, BrokenStore, FakeLink::default(), || {});

        assert_eq!(
            block_on(service.handle_line("SET_CONFIG pub_en=1")).as_str(),
            r#"{"ok":false,"err":"store"}"#
        );
        assert!(!config.get().publish_enabled);
        assert!(!gate.is_enabled());
    }

    #[test]
    fn send_connects_first() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(true);
        let link = FakeLink::default();
        let mut service = RequestService::new(&state, &calibration, &config, &gate, MemoryStore::new(), &link, || {});

        assert_eq!(block_on(service.handle_line("SEND")).as_str(), r#"{"ok":true}"#);
        assert_eq!(link.connects.get(), 1);
        assert!(link.connected.get());

        let held = gate.try_acquire();
        assert_eq!(block_on(service.handle_line("SEND")).as_str(), r#"{"ok":false,"err":"busy"}"#);
        drop(held);

        gate.set_enabled(false);
        assert_eq!(block_on(service.handle_line("SEND")).as_str(), r#"{"ok":false,"err":"publish"}"#);
        assert_eq!(link.connects.get(), 1);
        assert_eq!(link.published.get(), 1);
    }

    #[test]
    fn enabling_publish_at_runtime() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(config.get().publish_enabled);
        let link = FakeLink::default();
        let mut store = MemoryStore::new();
        let mut service = RequestService::new(&state, &calibration, &config, &gate, &mut store, &link, || {});

        assert_eq!(block_on(service.handle_line("SEND")).as_str(), r#"{"ok":false,"err":"publish"}"#);

        assert_eq!(
            block_on(service.handle_line("SET_CONFIG pub_en=1 pub_int_s=120 avg_alpha=0.5")).as_str(),
            r#"{"ok":true}"#
        );
        assert!(gate.is_enabled());
        assert_eq!(config.get().publish_interval_s, 120);
        assert_eq!(config.get().ema_alpha, 0.5);

        assert_eq!(block_on(service.handle_line("SEND")).as_str(), r#"{"ok":true}"#);
        assert_eq!(link.published.get(), 1);

        drop(service);
        assert_eq!(block_on(store.get_u32(keys::PUBLISH_ENABLED)), Ok(Some(1)));
        assert_eq!(block_on(RuntimeConfig::load(&mut store)), config.get());
    }

    #[test]
    fn config_round_trip_through_requests() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let config = SharedConfig::new();
        let gate = PublishGate::new(false);
        let mut service =
            RequestService::new(&state, &calibration, &config, &gate, MemoryStore::new(), FakeLink::default(), || {});

        assert_eq!(
            block_on(service.handle_line("CONFIG")).as_str(),
            concat!(
                r#"{"meas_int_ms":1000,"meas_off_cm":0.00,"avg_alpha":0.25,"median_n":5,"#,
                r#""median_delay_ms":50,"f_min_cm":2.00,"f_max_cm":400.00,"int_to_ms":600000,"#,
                r#""deep_int_s":30,"pub_en":false,"pub_int_s":30,"net_to_ms":8000}"#
            )
        );

        // half a sample is not a sample count, nothing is applied
        assert_eq!(
            block_on(service.handle_line("SET_CONFIG meas_int_ms=500 median_n=2.5")).as_str(),
            r#"{"ok":false,"err":"bad value"}"#
        );
        assert_eq!(config.get(), RuntimeConfig::default());

        // out of range values fall back to their defaults
        assert_eq!(
            block_on(service.handle_line("SET_CONFIG avg_alpha=3 median_n=7")).as_str(),
            r#"{"ok":true}"#
        );
        assert_eq!(config.get().ema_alpha, 0.25);
        assert_eq!(config.get().median_samples, 7);
    }
}
