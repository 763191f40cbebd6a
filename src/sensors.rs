//! Sensor sampling: rotor speed, vibration, and generator voltage.
//!
//! The hall-effect rotation sensor fires an interrupt once per revolution.
//! The interrupt handler only touches [`RotationCounter`], which is a pair of
//! atomics, so it never contends with the sampling loop.
//!
//! ```rust
//! use std::sync::Arc;
//! use turbine_sync::sensors::{RotationCounter, SensorSampler};
//! use turbine_sync::hal::{MockAccelerometer, MockAdc};
//!
//! let counter = Arc::new(RotationCounter::new());
//! let mut sampler = SensorSampler::new(
//!     Arc::clone(&counter),
//!     MockAccelerometer::new(),
//!     MockAdc::with_raw(1023),
//! );
//!
//! // Interrupt context: one revolution every 500 ms.
//! counter.record_pulse_at(1_000_000);
//! counter.record_pulse_at(1_500_000);
//! assert_eq!(sampler.calculate_speed(), 120.0);
//!
//! // No new pulse since the last sample.
//! assert_eq!(sampler.calculate_speed(), 0.0);
//! assert_eq!(sampler.read_voltage().unwrap(), 3.3);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::traits::{Accelerometer, Delay, Vector3, VoltageAdc};

/// ADC channel wired to the generator.
pub const VOLTAGE_CHANNEL: u8 = 0;

/// Sensor failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// The accelerometer did not answer.
    #[error("vibration sensor unavailable: {0}")]
    VibrationUnavailable(String),
    /// The ADC did not answer.
    #[error("voltage ADC unavailable: {0}")]
    AdcUnavailable(String),
    /// Calibration collected no readings.
    #[error("calibration collected no samples")]
    NoSamples,
    /// Calibration was interrupted by shutdown.
    #[error("calibration cancelled")]
    Cancelled,
}

// ============================================================================
// Rotation Counter
// ============================================================================

/// Revolution counter written from the interrupt context.
#[derive(Debug)]
pub struct RotationCounter {
    origin: Instant,
    count: AtomicU64,
    last_pulse_us: AtomicU64,
    elapsed_us: AtomicU64,
}

impl Default for RotationCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationCounter {
    /// Creates a counter with zero revolutions.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            count: AtomicU64::new(0),
            last_pulse_us: AtomicU64::new(0),
            elapsed_us: AtomicU64::new(0),
        }
    }

    /// Interrupt handler: one revolution completed now.
    pub fn record_pulse(&self) {
        let now_us = self.origin.elapsed().as_micros() as u64;
        self.record_pulse_at(now_us);
    }

    /// Record a revolution completed at `now_us` (microseconds since creation).
    pub fn record_pulse_at(&self, now_us: u64) {
        let previous = self.last_pulse_us.swap(now_us, Ordering::AcqRel);
        self.elapsed_us
            .store(now_us.saturating_sub(previous), Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Total revolutions since start-up.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Duration of the last full revolution.
    pub fn last_elapsed_us(&self) -> u64 {
        self.elapsed_us.load(Ordering::Acquire)
    }
}

// ============================================================================
// Vibration Statistics
// ============================================================================

/// Aggregates over one vibration window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VibrationStats {
    /// Largest magnitude.
    pub peak: f32,
    /// Mean magnitude.
    pub average: f32,
    /// Largest absolute X reading.
    pub peak_x: f32,
    /// Largest absolute Y reading.
    pub peak_y: f32,
    /// Largest absolute Z reading.
    pub peak_z: f32,
    /// Samples in the window.
    pub sample_count: u32,
    sum: f32,
}

impl VibrationStats {
    /// Fold one offset-corrected reading into the window.
    pub fn push(&mut self, sample: Vector3) {
        let magnitude = sample.magnitude();
        self.peak = self.peak.max(magnitude);
        self.peak_x = self.peak_x.max(sample.x.abs());
        self.peak_y = self.peak_y.max(sample.y.abs());
        self.peak_z = self.peak_z.max(sample.z.abs());
        self.sum += magnitude;
        self.sample_count += 1;
        self.average = self.sum / self.sample_count as f32;
    }

    /// Statistics over a complete window.
    pub fn from_samples(samples: &[Vector3]) -> Self {
        let mut stats = Self::default();
        for sample in samples {
            stats.push(*sample);
        }
        stats
    }
}

// ============================================================================
// Sensor Sampler
// ============================================================================

/// Calibration procedure parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibrationPlan {
    /// Readings averaged per axis.
    pub samples: u32,
    /// Pause between readings.
    pub sample_spacing_ms: u64,
    /// Pause between "is the rotor still" checks.
    pub settle_check_ms: u64,
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self {
            samples: 20,
            sample_spacing_ms: 100,
            settle_check_ms: 3000,
        }
    }
}

/// Reads the turbine sensors and keeps the calibration offsets.
pub struct SensorSampler<A: Accelerometer, V: VoltageAdc> {
    counter: Arc<RotationCounter>,
    last_count: u64,
    accelerometer: A,
    adc: V,
    offsets: Vector3,
}

impl<A: Accelerometer, V: VoltageAdc> SensorSampler<A, V> {
    /// Create a sampler with zero calibration offsets.
    pub fn new(counter: Arc<RotationCounter>, accelerometer: A, adc: V) -> Self {
        Self {
            counter,
            last_count: 0,
            accelerometer,
            adc,
            offsets: Vector3::default(),
        }
    }

    /// Shared rotation counter.
    pub fn counter(&self) -> &Arc<RotationCounter> {
        &self.counter
    }

    /// Total revolutions since start-up.
    pub fn rotation_count(&self) -> u64 {
        self.counter.count()
    }

    /// Rotor speed in RPM from the last full revolution.
    ///
    /// Returns exactly `0.0` when no revolution completed since the previous
    /// call.
    pub fn calculate_speed(&mut self) -> f32 {
        let count = self.counter.count();
        if count == self.last_count {
            return 0.0;
        }
        self.last_count = count;

        match self.counter.last_elapsed_us() {
            0 => 0.0,
            elapsed_us => (60_000_000.0 / elapsed_us as f64) as f32,
        }
    }

    /// Whether the accelerometer answers a read.
    pub fn is_vibration_sensor_available(&mut self) -> bool {
        match self.accelerometer.read_acceleration() {
            Ok(_) => true,
            Err(e) => {
                warn!(error = ?e, "vibration sensor check failed");
                false
            }
        }
    }

    /// One offset-corrected acceleration reading.
    pub fn read_vibration(&mut self) -> Result<Vector3, SensorError> {
        self.accelerometer
            .read_acceleration()
            .map(|raw| raw - self.offsets)
            .map_err(|e| SensorError::VibrationUnavailable(format!("{e:?}")))
    }

    /// Generator voltage, rounded to two decimals.
    pub fn read_voltage(&mut self) -> Result<f32, SensorError> {
        let raw = self
            .adc
            .read_channel(VOLTAGE_CHANNEL)
            .map_err(|e| SensorError::AdcUnavailable(format!("{e:?}")))?;
        Ok(raw_to_volts(raw))
    }

    /// Current calibration offsets.
    pub fn offsets(&self) -> Vector3 {
        self.offsets
    }

    /// Replace the calibration offsets.
    pub fn set_offsets(&mut self, offsets: Vector3) {
        self.offsets = offsets;
    }

    /// Measure the resting offsets of the accelerometer.
    ///
    /// Waits for the rotor to stop, then averages `plan.samples` readings per
    /// axis. On any failure the previous offsets are kept.
    pub fn calibrate<D: Delay + ?Sized>(
        &mut self,
        delay: &mut D,
        plan: CalibrationPlan,
        cancel: &AtomicBool,
    ) -> Result<Vector3, SensorError> {
        if !self.is_vibration_sensor_available() {
            warn!("the turbine appears to be disconnected, skipping vibration calibration");
            return Err(SensorError::VibrationUnavailable(
                "no answer before calibration".into(),
            ));
        }

        info!("keep the turbine stationary for calibration");
        self.calculate_speed();
        delay.delay_ms(plan.settle_check_ms);
        while self.calculate_speed() > 0.0 {
            if cancel.load(Ordering::Acquire) {
                return Err(SensorError::Cancelled);
            }
            warn!("please stop the turbine from spinning so the calibration can proceed");
            delay.delay_ms(plan.settle_check_ms);
        }

        let mut sum = Vector3::default();
        let mut taken = 0u32;
        for _ in 0..plan.samples {
            match self.accelerometer.read_acceleration() {
                Ok(v) => {
                    sum = Vector3::new(sum.x + v.x, sum.y + v.y, sum.z + v.z);
                    taken += 1;
                }
                Err(e) => warn!(error = ?e, "calibration read failed"),
            }
            delay.delay_ms(plan.sample_spacing_ms);
        }

        if taken == 0 {
            warn!("vibration calibration failed, keeping previous offsets");
            return Err(SensorError::NoSamples);
        }

        let n = taken as f32;
        self.offsets = Vector3::new(sum.x / n, sum.y / n, sum.z / n);
        info!(
            x = self.offsets.x,
            y = self.offsets.y,
            z = self.offsets.z,
            samples = taken,
            "vibration calibration complete"
        );
        Ok(self.offsets)
    }
}

/// Convert a 10-bit ADC reading (3.3 V reference) to volts, two decimals.
pub fn raw_to_volts(raw: u16) -> f32 {
    let volts = (3300.0 / 1023.0) * f64::from(raw) / 1000.0;
    ((volts * 100.0).round() / 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockAccelerometer, MockAdc, MockDelay};

    fn sampler(accel: MockAccelerometer) -> SensorSampler<MockAccelerometer, MockAdc> {
        SensorSampler::new(Arc::new(RotationCounter::new()), accel, MockAdc::with_raw(512))
    }

    // ========================================================================
    // Speed
    // ========================================================================

    #[test]
    fn speed_from_last_revolution() {
        let mut s = sampler(MockAccelerometer::new());
        s.counter().record_pulse_at(2_000_000);
        s.counter().record_pulse_at(3_000_000);
        assert_eq!(s.calculate_speed(), 60.0);
    }

    #[test]
    fn unchanged_counter_is_exactly_zero() {
        let mut s = sampler(MockAccelerometer::new());
        assert_eq!(s.calculate_speed(), 0.0);

        s.counter().record_pulse_at(1_000_000);
        s.counter().record_pulse_at(1_250_000);
        assert_eq!(s.calculate_speed(), 240.0);
        assert_eq!(s.calculate_speed(), 0.0);
        assert_eq!(s.rotation_count(), 2);
    }

    #[test]
    fn real_clock_pulses_count() {
        let counter = RotationCounter::new();
        counter.record_pulse();
        counter.record_pulse();
        assert_eq!(counter.count(), 2);
    }

    // ========================================================================
    // Vibration
    // ========================================================================

    #[test]
    fn pythagorean_peak() {
        let stats = VibrationStats::from_samples(&[Vector3::new(3.0, 4.0, 0.0)]);
        assert_eq!(stats.peak, 5.0);
        assert_eq!(stats.average, 5.0);
        assert_eq!(stats.sample_count, 1);
    }

    #[test]
    fn window_aggregates() {
        let stats = VibrationStats::from_samples(&[
            Vector3::new(3.0, 4.0, 0.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(-2.0, 0.0, 0.0),
        ]);
        assert_eq!(stats.peak, 5.0);
        assert!((stats.average - 8.0 / 3.0).abs() < 1e-6);
        assert_eq!(stats.peak_x, 3.0);
        assert_eq!(stats.peak_y, 4.0);
        assert_eq!(stats.peak_z, 1.0);
        assert_eq!(stats.sample_count, 3);
    }

    #[test]
    fn empty_window_is_zero() {
        let stats = VibrationStats::from_samples(&[]);
        assert_eq!(stats, VibrationStats::default());
    }

    #[test]
    fn readings_are_offset_corrected() {
        let mut accel = MockAccelerometer::new();
        accel.queue(Vector3::new(3.5, 4.5, 9.8));
        let mut s = sampler(accel);
        s.set_offsets(Vector3::new(0.5, 0.5, 9.8));
        assert_eq!(s.read_vibration().unwrap().magnitude(), 5.0);
    }

    #[test]
    fn offline_sensor_reports_unavailable() {
        let mut accel = MockAccelerometer::new();
        accel.offline = true;
        let mut s = sampler(accel);
        assert!(!s.is_vibration_sensor_available());
        assert!(matches!(
            s.read_vibration(),
            Err(SensorError::VibrationUnavailable(_))
        ));
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    #[test]
    fn calibration_averages_resting_readings() {
        let mut s = sampler(MockAccelerometer::resting_at(Vector3::new(0.25, -0.5, 9.75)));
        let mut delay = MockDelay::new();
        let offsets = s
            .calibrate(&mut delay, CalibrationPlan::default(), &AtomicBool::new(false))
            .unwrap();

        assert_eq!(offsets, Vector3::new(0.25, -0.5, 9.75));
        assert_eq!(s.offsets(), offsets);
        // settle check, then 20 samples 100 ms apart
        assert_eq!(delay.history()[0], 3000);
        assert_eq!(delay.history().len(), 21);
    }

    #[test]
    fn calibration_waits_for_rotor_to_stop() {
        let mut s = sampler(MockAccelerometer::new());
        let counter = Arc::clone(s.counter());
        let delay = MockDelay::new();
        // The rotor keeps turning through the first settle check only.
        let mut pulses = 0u64;
        delay.on_delay(move |ms| {
            if ms == 3000 && pulses < 2 {
                pulses += 1;
                counter.record_pulse_at(pulses * 1_000_000);
            }
        });

        s.calibrate(&mut delay.clone(), CalibrationPlan::default(), &AtomicBool::new(false))
            .unwrap();
        let settle_checks = delay.history().iter().filter(|ms| **ms == 3000).count();
        assert!(settle_checks >= 2);
    }

    #[test]
    fn calibration_unavailable_keeps_offsets() {
        let mut accel = MockAccelerometer::new();
        accel.offline = true;
        let mut s = sampler(accel);
        s.set_offsets(Vector3::new(1.0, 1.0, 1.0));

        let result = s.calibrate(
            &mut MockDelay::new(),
            CalibrationPlan::default(),
            &AtomicBool::new(false),
        );
        assert!(result.is_err());
        assert_eq!(s.offsets(), Vector3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn calibration_cancelled_while_spinning() {
        let mut s = sampler(MockAccelerometer::new());
        let counter = Arc::clone(s.counter());
        let delay = MockDelay::new();
        let mut t = 0u64;
        delay.on_delay(move |_| {
            t += 500_000;
            counter.record_pulse_at(t);
        });

        let cancel = AtomicBool::new(true);
        let result = s.calibrate(&mut delay.clone(), CalibrationPlan::default(), &cancel);
        assert_eq!(result, Err(SensorError::Cancelled));
    }

    // ========================================================================
    // Voltage
    // ========================================================================

    #[test]
    fn voltage_conversion() {
        assert_eq!(raw_to_volts(0), 0.0);
        assert_eq!(raw_to_volts(1023), 3.3);
        assert_eq!(raw_to_volts(512), 1.65);
    }

    #[test]
    fn voltage_adc_failure() {
        let mut adc = MockAdc::with_raw(100);
        adc.offline = true;
        let mut s = SensorSampler::new(Arc::new(RotationCounter::new()), MockAccelerometer::new(), adc);
        assert!(matches!(s.read_voltage(), Err(SensorError::AdcUnavailable(_))));
    }
}
