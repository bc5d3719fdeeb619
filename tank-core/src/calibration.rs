//! Distance to height calibration
//!
//! Three reference points `(measured_cm, height_cm)` taken on the installed tank define the
//! quadratic `height = a·x² + b·x + c` through them (Lagrange form, solved in closed form):
//!
//! ```text
//! d = (x1 - x2)(x1 - x3)(x2 - x3)
//! a = (x3(y2 - y1) + x2(y1 - y3) + x1(y3 - y2)) / d
//! b = (x3²(y1 - y2) + x2²(y3 - y1) + x1²(y2 - y3)) / d
//! c = (x2·x3(x2 - x3)y1 + x3·x1(x3 - x1)y2 + x1·x2(x1 - x2)y3) / d
//! ```
//!
//! A measured value of 0 means "not captured yet". The model is only valid when all three
//! measured values are non-zero and pairwise distinct; an invalid model keeps its last
//! coefficients but refuses to estimate (see [`PolynomialModel::fitted`]).
//!
//! Besides the points the calibration holds the two tank reference distances used for the
//! fill gauge.

use crate::storage::{SettingsStore, StoreError};

/// Number of calibration points
pub const POINT_COUNT: usize = 3;

/// Heights offered before anything is calibrated
pub const DEFAULT_HEIGHTS_CM: [f32; POINT_COUNT] = [50.0, 100.0, 150.0];

/// Store keys
pub mod keys {
    pub const MEASURED: [&str; super::POINT_COUNT] = ["m0", "m1", "m2"];
    pub const HEIGHT: [&str; super::POINT_COUNT] = ["h0", "h1", "h2"];
    pub const TANK_EMPTY: &str = "cuveVide";
    pub const TANK_FULL: &str = "cuvePleine";
}

/// One reference pair
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationPoint {
    pub measured_cm: f32,
    pub height_cm: f32,
}

/// Quadratic distance to height mapping
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PolynomialModel {
    a: f64,
    b: f64,
    c: f64,
    valid: bool,
}

/// Coefficients of a model that passed its validity check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fitted {
    a: f64,
    b: f64,
    c: f64,
}

impl Fitted {
    /// Height for a measured distance
    pub fn estimate(&self, x: f32) -> f32 {
        let x = f64::from(x);
        (self.a * x * x + self.b * x + self.c) as f32
    }
}

impl PolynomialModel {
    pub const fn uncalibrated() -> Self {
        Self {
            a: 0.0,
            b: 0.0,
            c: 0.0,
            valid: false,
        }
    }

    /// Solves for the points, returns the new validity
    ///
    /// Degenerate points only clear the validity flag, the coefficients stay as they were.
    pub fn recompute(&mut self, points: &[CalibrationPoint; POINT_COUNT]) -> bool {
        let [x1, x2, x3] = points.map(|p| f64::from(p.measured_cm));
        let [y1, y2, y3] = points.map(|p| f64::from(p.height_cm));

        if x1 == 0.0 || x2 == 0.0 || x3 == 0.0 || x1 == x2 || x1 == x3 || x2 == x3 {
            self.valid = false;
            return false;
        }
        let denom = (x1 - x2) * (x1 - x3) * (x2 - x3);
        if denom == 0.0 || !denom.is_finite() {
            self.valid = false;
            return false;
        }

        self.a = (x3 * (y2 - y1) + x2 * (y1 - y3) + x1 * (y3 - y2)) / denom;
        self.b = (x3 * x3 * (y1 - y2) + x2 * x2 * (y3 - y1) + x1 * x1 * (y2 - y3)) / denom;
        self.c = (x2 * x3 * (x2 - x3) * y1 + x3 * x1 * (x3 - x1) * y2 + x1 * x2 * (x1 - x2) * y3) / denom;
        self.valid = true;
        true
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Raw coefficients `(a, b, c)`, meaningless while invalid
    pub fn coefficients(&self) -> (f64, f64, f64) {
        (self.a, self.b, self.c)
    }

    /// The model, if it may be used for estimation
    pub fn fitted(&self) -> Option<Fitted> {
        self.valid.then_some(Fitted {
            a: self.a,
            b: self.b,
            c: self.c,
        })
    }
}

/// Reference distances of the empty and the full tank
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TankLevels {
    pub empty_cm: f32,
    pub full_cm: f32,
}

impl Default for TankLevels {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TankLevels {
    pub const DEFAULT: Self = Self {
        empty_cm: 123.0,
        full_cm: 42.0,
    };

    /// Fill level in percent for a measured distance
    ///
    /// `None` without a measurement or when both references coincide.
    pub fn fill_percent(&self, measured_cm: Option<f32>) -> Option<u8> {
        let measured = measured_cm.filter(|m| *m > 0.0)?;
        let span = self.empty_cm - self.full_cm;
        if libm::fabsf(span) < 1e-3 {
            return None;
        }
        let ratio = ((self.empty_cm - measured) / span).clamp(0.0, 1.0);
        Some(libm::roundf(ratio * 100.0) as u8)
    }
}

/// Calibration failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationError {
    /// Point index outside 0..3
    IndexOutOfRange,
    /// There is no measurement to capture
    NoMeasurement,
    /// Persisting failed, RAM state unchanged
    Store(StoreError),
}

impl From<StoreError> for CalibrationError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Calibration points, tank references and the model derived from them
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Calibration {
    points: [CalibrationPoint; POINT_COUNT],
    levels: TankLevels,
    model: PolynomialModel,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}

impl Calibration {
    /// Nothing captured, default heights and tank references
    pub const fn new() -> Self {
        let mut points = [CalibrationPoint {
            measured_cm: 0.0,
            height_cm: 0.0,
        }; POINT_COUNT];
        let mut i = 0;
        while i < POINT_COUNT {
            points[i].height_cm = DEFAULT_HEIGHTS_CM[i];
            i += 1;
        }
        Self {
            points,
            levels: TankLevels::DEFAULT,
            model: PolynomialModel::uncalibrated(),
        }
    }

    /// Builds a calibration from explicit points
    pub fn with_points(points: [CalibrationPoint; POINT_COUNT]) -> Self {
        let mut calibration = Self {
            points,
            ..Self::new()
        };
        calibration.model.recompute(&calibration.points);
        calibration
    }

    /// Reads points and tank references, missing keys keep their default
    pub async fn load<S: SettingsStore>(store: &mut S) -> Self {
        let mut calibration = Self::new();

        for (i, point) in calibration.points.iter_mut().enumerate() {
            if let Some(v) = read_f32(store, keys::MEASURED[i]).await {
                point.measured_cm = v;
            }
            if let Some(v) = read_f32(store, keys::HEIGHT[i]).await {
                point.height_cm = v;
            }
        }
        if let Some(v) = read_f32(store, keys::TANK_EMPTY).await {
            calibration.levels.empty_cm = v;
        }
        if let Some(v) = read_f32(store, keys::TANK_FULL).await {
            calibration.levels.full_cm = v;
        }

        let valid = calibration.model.recompute(&calibration.points);
        info!("calibration loaded, model valid: {}", valid);
        calibration
    }

    pub fn points(&self) -> &[CalibrationPoint; POINT_COUNT] {
        &self.points
    }

    pub fn levels(&self) -> TankLevels {
        self.levels
    }

    pub fn model(&self) -> &PolynomialModel {
        &self.model
    }

    /// Height for a measured distance, `None` while uncalibrated
    pub fn estimate_height(&self, measured_cm: f32) -> Option<f32> {
        self.model.fitted().map(|m| m.estimate(measured_cm))
    }

    /// Captures `measured_cm` as point `index` with the given height
    ///
    /// Persists first, then updates the point and recomputes. Returns the model validity. A
    /// failed height write puts the previous distance back, so flash never holds half a pair.
    pub async fn save_point<S: SettingsStore>(
        &mut self,
        store: &mut S,
        index: usize,
        measured_cm: Option<f32>,
        height_cm: f32,
    ) -> Result<bool, CalibrationError> {
        if index >= POINT_COUNT {
            return Err(CalibrationError::IndexOutOfRange);
        }
        let measured_cm = measured_cm
            .filter(|m| *m > 0.0 && m.is_finite())
            .ok_or(CalibrationError::NoMeasurement)?;

        store.put_f32(keys::MEASURED[index], measured_cm).await?;
        if let Err(e) = store.put_f32(keys::HEIGHT[index], height_cm).await {
            self.restore_measured(store, index).await;
            return Err(e.into());
        }

        self.points[index] = CalibrationPoint {
            measured_cm,
            height_cm,
        };
        let valid = self.model.recompute(&self.points);
        info!("calibration point {} saved, model valid: {}", index, valid);
        Ok(valid)
    }

    async fn restore_measured<S: SettingsStore>(&self, store: &mut S, index: usize) {
        let key = keys::MEASURED[index];
        let previous = self.points[index].measured_cm;
        // an unset distance is stored as no key at all
        let restored = if previous > 0.0 {
            store.put_f32(key, previous).await
        } else {
            store.remove(key).await
        };
        if let Err(e) = restored {
            warn!("point {} left half written: {:?}", index, e);
        }
    }

    /// Forgets all captured points and the stored tank references
    ///
    /// Heights and the in-RAM tank references are kept so the next capture has sensible
    /// defaults.
    pub async fn clear<S: SettingsStore>(&mut self, store: &mut S) -> Result<(), CalibrationError> {
        for i in 0..POINT_COUNT {
            store.remove(keys::MEASURED[i]).await?;
            store.remove(keys::HEIGHT[i]).await?;
        }
        store.remove(keys::TANK_EMPTY).await?;
        store.remove(keys::TANK_FULL).await?;

        for point in self.points.iter_mut() {
            point.measured_cm = 0.0;
        }
        self.model.recompute(&self.points);
        info!("calibration cleared");
        Ok(())
    }

    /// Updates and persists the given tank references
    pub async fn set_tank_levels<S: SettingsStore>(
        &mut self,
        store: &mut S,
        empty_cm: Option<f32>,
        full_cm: Option<f32>,
    ) -> Result<TankLevels, CalibrationError> {
        let mut levels = self.levels;
        if let Some(v) = empty_cm {
            levels.empty_cm = v;
        }
        if let Some(v) = full_cm {
            levels.full_cm = v;
        }

        store.put_f32(keys::TANK_EMPTY, levels.empty_cm).await?;
        store.put_f32(keys::TANK_FULL, levels.full_cm).await?;
        self.levels = levels;
        Ok(levels)
    }
}

async fn read_f32<S: SettingsStore>(store: &mut S, key: &str) -> Option<f32> {
    match store.get_f32(key).await {
        Ok(v) => v,
        Err(e) => {
            warn!("reading {} failed: {:?}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use embassy_futures::block_on;
    use proptest::prelude::*;

    /// Memory store that refuses to write heights
    struct NoHeights(MemoryStore);

    impl SettingsStore for NoHeights {
        async fn get_f32(&mut self, key: &str) -> Result<Option<f32>, StoreError> {
            self.0.get_f32(key).await
        }
        async fn put_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError> {
            if key.starts_with('h') {
                return Err(StoreError::Backend);
            }
            self.0.put_f32(key, value).await
        }
        async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StoreError> {
            self.0.get_u32(key).await
        }
        async fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
            self.0.put_u32(key, value).await
        }
        async fn remove(&mut self, key: &str) -> Result<(), StoreError> {
            self.0.remove(key).await
        }
    }

    fn points(pairs: [(f32, f32); 3]) -> [CalibrationPoint; 3] {
        pairs.map(|(measured_cm, height_cm)| CalibrationPoint { measured_cm, height_cm })
    }

    #[test]
    fn linear_points_recover_a_line() {
        let mut model = PolynomialModel::uncalibrated();
        assert!(model.recompute(&points([(10.0, 50.0), (20.0, 100.0), (30.0, 150.0)])));

        let (a, b, c) = model.coefficients();
        assert!(a.abs() < 1e-9);
        assert!((b - 5.0).abs() < 1e-9);
        assert!(c.abs() < 1e-9);
        assert_eq!(model.fitted().map(|m| m.estimate(25.0)), Some(125.0));
    }

    #[test]
    fn duplicate_measurement_invalidates_and_keeps_coefficients() {
        let mut model = PolynomialModel::uncalibrated();
        model.recompute(&points([(10.0, 50.0), (20.0, 100.0), (30.0, 150.0)]));
        let before = model.coefficients();

        assert!(!model.recompute(&points([(10.0, 50.0), (10.0, 80.0), (30.0, 150.0)])));
        assert!(!model.is_valid());
        assert_eq!(model.coefficients(), before);
        assert!(model.fitted().is_none());
    }

    #[test]
    fn zero_measurement_means_uncalibrated() {
        let mut model = PolynomialModel::uncalibrated();
        assert!(!model.recompute(&points([(0.0, 50.0), (20.0, 100.0), (30.0, 150.0)])));
        assert!(Calibration::new().estimate_height(42.0).is_none());
    }

    #[test]
    fn fill_percent_follows_tank_references() {
        let levels = TankLevels {
            empty_cm: 120.0,
            full_cm: 20.0,
        };
        assert_eq!(levels.fill_percent(Some(120.0)), Some(0));
        assert_eq!(levels.fill_percent(Some(70.0)), Some(50));
        assert_eq!(levels.fill_percent(Some(10.0)), Some(100));
        assert_eq!(levels.fill_percent(Some(200.0)), Some(0));
        assert_eq!(levels.fill_percent(None), None);

        let flat = TankLevels {
            empty_cm: 50.0,
            full_cm: 50.0,
        };
        assert_eq!(flat.fill_percent(Some(40.0)), None);
    }

    #[test]
    fn capture_persist_and_reload() {
        let mut store = MemoryStore::new();
        let mut calibration = Calibration::new();

        block_on(async {
            assert_eq!(calibration.save_point(&mut store, 0, Some(10.0), 50.0).await, Ok(false));
            assert_eq!(calibration.save_point(&mut store, 1, Some(20.0), 100.0).await, Ok(false));
            assert_eq!(calibration.save_point(&mut store, 2, Some(30.0), 150.0).await, Ok(true));
            calibration.set_tank_levels(&mut store, Some(110.0), None).await.unwrap();
        });
        assert_eq!(calibration.estimate_height(25.0), Some(125.0));

        let reloaded = block_on(Calibration::load(&mut store));
        assert_eq!(reloaded, calibration);
        assert_eq!(reloaded.levels().empty_cm, 110.0);
        assert_eq!(reloaded.levels().full_cm, 42.0);
    }

    #[test]
    fn capture_rejects_bad_input() {
        let mut store = MemoryStore::new();
        let mut calibration = Calibration::new();
        block_on(async {
            assert_eq!(
                calibration.save_point(&mut store, 3, Some(10.0), 50.0).await,
                Err(CalibrationError::IndexOutOfRange)
            );
            assert_eq!(
                calibration.save_point(&mut store, 0, None, 50.0).await,
                Err(CalibrationError::NoMeasurement)
            );
            assert_eq!(
                calibration.save_point(&mut store, 0, Some(-1.0), 50.0).await,
                Err(CalibrationError::NoMeasurement)
            );
        });
        assert!(store.is_empty());
    }

    #[test]
    fn clear_forgets_points_and_references() {
        let mut store = MemoryStore::new();
        let mut calibration = Calibration::new();
        block_on(async {
            calibration.save_point(&mut store, 0, Some(10.0), 50.0).await.unwrap();
            calibration.save_point(&mut store, 1, Some(20.0), 100.0).await.unwrap();
            calibration.save_point(&mut store, 2, Some(30.0), 150.0).await.unwrap();
            calibration.set_tank_levels(&mut store, Some(100.0), Some(30.0)).await.unwrap();
            calibration.clear(&mut store).await.unwrap();
        });

        assert!(store.is_empty());
        assert!(!calibration.model().is_valid());
        assert!(calibration.points().iter().all(|p| p.measured_cm == 0.0));
        assert_eq!(calibration.points()[2].height_cm, 150.0);
    }

    #[test]
    fn failed_height_write_keeps_the_stored_pair() {
        let mut store = MemoryStore::new();
        let mut calibration = Calibration::new();
        block_on(calibration.save_point(&mut store, 0, Some(12.0), 50.0)).unwrap();

        let mut store = NoHeights(store);
        let result = block_on(calibration.save_point(&mut store, 0, Some(30.0), 80.0));
        assert_eq!(result, Err(CalibrationError::Store(StoreError::Backend)));
        assert_eq!(block_on(store.get_f32(keys::MEASURED[0])), Ok(Some(12.0)));
        assert_eq!(calibration.points()[0].measured_cm, 12.0);

        // a point that was never captured goes back to absent
        let result = block_on(calibration.save_point(&mut store, 1, Some(40.0), 90.0));
        assert!(result.is_err());
        assert_eq!(block_on(store.get_f32(keys::MEASURED[1])), Ok(None));
        assert_eq!(block_on(store.get_f32(keys::HEIGHT[0])), Ok(Some(50.0)));
    }

    proptest! {
        #[test]
        fn interpolation_hits_every_point(
            x1 in 1.0f32..400.0,
            d2 in 1.0f32..200.0,
            d3 in 1.0f32..200.0,
            ys in proptest::array::uniform3(-500.0f32..500.0),
        ) {
            let x2 = x1 + d2;
            let x3 = x2 + d3;
            let pts = points([(x2, ys[0]), (x1, ys[1]), (x3, ys[2])]);

            let mut model = PolynomialModel::uncalibrated();
            prop_assert!(model.recompute(&pts));
            let fitted = model.fitted().unwrap();
            for p in pts {
                let err = (fitted.estimate(p.measured_cm) - p.height_cm).abs();
                prop_assert!(err <= 1e-2 + 1e-4 * p.height_cm.abs(), "error {} at {:?}", err, p);
            }
        }
    }
}
