use crate::error::{TelemetryError, TelemetryResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Voltage assumed per phase when projecting charge power. Live voltage reads zero
/// while the car is not drawing current, so it cannot be used here.
pub const DEFAULT_NOMINAL_VOLTAGE: f64 = 230.0;

const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarSnapshot {
    /// Percent.
    pub current_soc: f64,
    /// Percent.
    pub target_soc: f64,
    pub usable_energy_wh: f64,
    pub max_current_a: f64,
    pub active_phases: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarState {
    pub id: String,
    pub name: String,
    pub snapshot: CarSnapshot,
    #[serde(default)]
    pub projected_ready_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeProjection {
    pub energy_needed_wh: f64,
    pub power_w: f64,
    pub duration_until_target: ChronoDuration,
}

impl ChargeProjection {
    fn ready() -> Self {
        Self {
            energy_needed_wh: 0.0,
            power_w: 0.0,
            duration_until_target: ChronoDuration::zero(),
        }
    }

    pub fn hours(&self) -> f64 {
        self.duration_until_target.num_milliseconds() as f64 / MS_PER_HOUR
    }
}

/// Advisory time-to-target projection. Assumes sustained full-power charging and ignores
/// tapering near full, thermal limits and grid constraints.
#[derive(Debug, Clone, Copy)]
pub struct ChargeTimeEstimator {
    nominal_voltage: f64,
}

impl Default for ChargeTimeEstimator {
    fn default() -> Self {
        Self {
            nominal_voltage: DEFAULT_NOMINAL_VOLTAGE,
        }
    }
}

impl ChargeTimeEstimator {
    pub fn new(nominal_voltage: f64) -> TelemetryResult<Self> {
        if !nominal_voltage.is_finite() || nominal_voltage <= 0.0 {
            return Err(TelemetryError::configuration(format!(
                "nominal voltage must be a positive number, got {nominal_voltage}"
            )));
        }
        Ok(Self { nominal_voltage })
    }

    pub fn nominal_voltage(&self) -> f64 {
        self.nominal_voltage
    }

    /// `None` when the snapshot describes a car that cannot charge at all, or one charging so
    /// slowly that the duration does not fit a `chrono` duration.
    pub fn time_to_target(&self, snapshot: &CarSnapshot) -> Option<ChargeProjection> {
        let soc_delta = snapshot.target_soc - snapshot.current_soc;
        if !soc_delta.is_finite() {
            return None;
        }
        if soc_delta < 1.0 {
            return Some(ChargeProjection::ready());
        }

        let power_w =
            snapshot.max_current_a * f64::from(snapshot.active_phases) * self.nominal_voltage;
        if !power_w.is_finite()
            || power_w <= 0.0
            || !snapshot.usable_energy_wh.is_finite()
            || snapshot.usable_energy_wh <= 0.0
        {
            return None;
        }

        let energy_needed_wh = snapshot.usable_energy_wh * soc_delta / 100.0;
        let millis = (energy_needed_wh / power_w * MS_PER_HOUR).round();
        // A trickle current can push the projection past what a timestamp can hold.
        if !millis.is_finite() || millis >= i64::MAX as f64 {
            return None;
        }
        let duration_until_target = ChronoDuration::try_milliseconds(millis as i64)?;
        Some(ChargeProjection {
            energy_needed_wh,
            power_w,
            duration_until_target,
        })
    }

    /// Stamps `now + duration` on the car, or clears the stamp when no projection exists or
    /// the ready time would fall outside the representable calendar.
    pub fn update_projected_ready_time(
        &self,
        car: &mut CarState,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let projected = self
            .time_to_target(&car.snapshot)
            .and_then(|projection| now.checked_add_signed(projection.duration_until_target));
        if projected.is_none() {
            tracing::debug!(car = %car.id, "car cannot charge; clearing projected ready time");
        }
        car.projected_ready_at = projected;
        projected
    }

    pub fn update_all(&self, cars: &mut [CarState], now: DateTime<Utc>) -> usize {
        cars.iter_mut()
            .filter_map(|car| self.update_projected_ready_time(car, now))
            .count()
    }
}
