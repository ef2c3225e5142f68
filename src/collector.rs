//! Per-scrape collection: account -> homes -> zones, continuing past failures at every level.
//!
//! Only a failure to resolve the account's homes aborts a scrape, and even that leaves every
//! domain gauge untouched so the last good values keep being served. Everything else is logged,
//! accumulated into a [`ScrapeOutcome`] and counted in the self-monitoring metrics.

use chrono::Utc;
use core::fmt;
use log::{debug, error, info, warn};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use std::time::{Duration, Instant};

use crate::deadline::Deadline;
use crate::extract::{self, Field, TemperatureReading, ValidationError, ZoneReading};
use crate::metrics::{self, ExporterMetrics, TadoMetrics, ZoneLabels};
use crate::models::tado::{HomeId, ZoneId};
use crate::upstream::{Upstream, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Enumeration,
    HomeState,
    Weather,
    ZoneList,
    ZoneStateMissing,
    ZoneInvalid,
    Validation,
    CircuitOpen,
    Deadline,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Enumeration,
        ErrorKind::HomeState,
        ErrorKind::Weather,
        ErrorKind::ZoneList,
        ErrorKind::ZoneStateMissing,
        ErrorKind::ZoneInvalid,
        ErrorKind::Validation,
        ErrorKind::CircuitOpen,
        ErrorKind::Deadline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Enumeration => "enumeration",
            ErrorKind::HomeState => "home_state",
            ErrorKind::Weather => "weather",
            ErrorKind::ZoneList => "zone_list",
            ErrorKind::ZoneStateMissing => "zone_state_missing",
            ErrorKind::ZoneInvalid => "zone_invalid",
            ErrorKind::Validation => "validation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Deadline => "deadline",
        }
    }

    /// Breaker rejections and deadline expiry keep their own category whatever the call was.
    fn for_upstream(call_kind: ErrorKind, err: &UpstreamError) -> ErrorKind {
        match err {
            UpstreamError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            UpstreamError::DeadlineExceeded => ErrorKind::Deadline,
            UpstreamError::Client(_) => call_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeError {
    pub kind: ErrorKind,
    pub home_id: Option<HomeId>,
    pub zone_id: Option<ZoneId>,
    pub message: String,
}

impl fmt::Display for ScrapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind.as_str())?;
        if let Some(home) = self.home_id {
            write!(f, " home {}", home.0)?;
        }
        if let Some(zone) = self.zone_id {
            write!(f, " zone {}", zone.0)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Summary of one scrape, used for logging and self-monitoring only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeOutcome {
    pub enumeration_failed: bool,
    pub homes_attempted: usize,
    pub homes_failed: usize,
    pub zones_attempted: usize,
    pub zones_failed: usize,
    pub errors: Vec<ScrapeError>,
}

impl ScrapeOutcome {
    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &ScrapeError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    fn push(&mut self, kind: ErrorKind, home_id: Option<HomeId>, zone_id: Option<ZoneId>, message: String) {
        self.errors.push(ScrapeError {
            kind,
            home_id,
            zone_id,
            message,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorSettings {
    pub scrape_timeout: Duration,
    pub home_filter: Option<HomeId>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        CollectorSettings {
            scrape_timeout: Duration::from_secs(10),
            home_filter: None,
        }
    }
}

pub struct TadoCollector<U> {
    upstream: U,
    settings: CollectorSettings,
    metrics: TadoMetrics,
    exporter: ExporterMetrics,
}

impl<U: Upstream> TadoCollector<U> {
    pub fn new(upstream: U, settings: CollectorSettings, metrics: TadoMetrics, exporter: ExporterMetrics) -> Self {
        for kind in ErrorKind::ALL {
            let _ = exporter.collection_errors_total.with_label_values(&[kind.as_str()]);
        }
        TadoCollector {
            upstream,
            settings,
            metrics,
            exporter,
        }
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn metrics(&self) -> &TadoMetrics {
        &self.metrics
    }

    pub fn exporter_metrics(&self) -> &ExporterMetrics {
        &self.exporter
    }

    /// Run one collection pass. Never fails: problems end up in the returned outcome.
    pub fn scrape(&self) -> ScrapeOutcome {
        let started = Instant::now();
        let deadline = Deadline::after(self.settings.scrape_timeout);
        let mut outcome = ScrapeOutcome::default();

        match self.enumerate_homes(&deadline) {
            Ok(homes) => {
                self.exporter.authentication_valid.set(1);
                self.exporter
                    .last_authentication_success_unixtime
                    .set(Utc::now().timestamp());

                let homes = self.apply_home_filter(homes);
                for (index, home_id) in homes.iter().enumerate() {
                    if deadline.is_expired() {
                        let skipped = homes.len() - index;
                        warn!("Scrape deadline exceeded; skipping {} remaining home(s)", skipped);
                        outcome.push(
                            ErrorKind::Deadline,
                            Some(*home_id),
                            None,
                            format!("deadline exceeded before home was collected ({} home(s) skipped)", skipped),
                        );
                        break;
                    }
                    self.collect_home(*home_id, &deadline, &mut outcome);
                }
            }
            Err((kind, message)) => {
                error!("Could not resolve the account's homes: {}", message);
                self.exporter.authentication_valid.set(0);
                self.exporter.authentication_errors_total.inc();
                outcome.enumeration_failed = true;
                outcome.push(kind, None, None, message);
            }
        }

        for e in &outcome.errors {
            self.exporter
                .collection_errors_total
                .with_label_values(&[e.kind.as_str()])
                .inc();
        }
        self.exporter.scrape_errors_total.inc_by(outcome.errors.len() as u64);
        let elapsed = started.elapsed();
        self.exporter.scrape_duration_seconds.observe(elapsed.as_secs_f64());

        debug!(
            "Scrape finished in {:.3}s: homes {}/{} ok, zones {}/{} ok, {} error(s)",
            elapsed.as_secs_f64(),
            outcome.homes_attempted - outcome.homes_failed,
            outcome.homes_attempted,
            outcome.zones_attempted - outcome.zones_failed,
            outcome.zones_attempted,
            outcome.errors.len()
        );
        outcome
    }

    fn enumerate_homes(&self, deadline: &Deadline) -> Result<Vec<HomeId>, (ErrorKind, String)> {
        let me = self
            .upstream
            .get_me(deadline)
            .map_err(|e| (ErrorKind::for_upstream(ErrorKind::Enumeration, &e), e.to_string()))?;
        let homes = me.home_ids();
        if homes.is_empty() {
            return Err((ErrorKind::Enumeration, "account has no homes".to_string()));
        }
        Ok(homes)
    }

    fn apply_home_filter(&self, homes: Vec<HomeId>) -> Vec<HomeId> {
        let Some(wanted) = self.settings.home_filter else {
            return homes;
        };
        if !homes.contains(&wanted) {
            warn!(
                "Configured home {} is not among the account's homes ({}); nothing to collect",
                wanted.0,
                homes.iter().map(|h| h.0.to_string()).collect::<Vec<_>>().join(", ")
            );
        }
        homes.into_iter().filter(|h| *h == wanted).collect()
    }

    fn fetch<T>(
        &self,
        outcome: &mut ScrapeOutcome,
        kind: ErrorKind,
        home_id: HomeId,
        what: &str,
        call: impl FnOnce(&U) -> Result<T, UpstreamError>,
    ) -> Option<T> {
        match call(&self.upstream) {
            Ok(value) => Some(value),
            Err(e) => {
                if e.is_circuit_open() {
                    warn!("Home {}: {} skipped: {}", home_id.0, what, e);
                } else {
                    warn!("Home {}: fetching {} failed: {}", home_id.0, what, e);
                }
                outcome.push(
                    ErrorKind::for_upstream(kind, &e),
                    Some(home_id),
                    None,
                    format!("{}: {}", what, e),
                );
                None
            }
        }
    }

    fn collect_home(&self, home_id: HomeId, deadline: &Deadline, outcome: &mut ScrapeOutcome) {
        outcome.homes_attempted += 1;

        let home_level_ok = self.collect_home_level(home_id, deadline, outcome);
        let zone_level_ok = self.collect_zones(home_id, deadline, outcome);

        if !(home_level_ok && zone_level_ok) {
            outcome.homes_failed += 1;
        }
    }

    /// Presence and weather; the two calls succeed or fail independently.
    fn collect_home_level(&self, home_id: HomeId, deadline: &Deadline, outcome: &mut ScrapeOutcome) -> bool {
        let mut ok = true;

        match self.fetch(outcome, ErrorKind::HomeState, home_id, "home state", |u| {
            u.get_home_state(home_id, deadline)
        }) {
            Some(state) => {
                if let Some(present) = extract::resident_present(&state) {
                    self.metrics.resident_present.set(bool_value(present));
                }
            }
            None => ok = false,
        }

        match self.fetch(outcome, ErrorKind::Weather, home_id, "weather", |u| u.get_weather(home_id, deadline)) {
            Some(weather) => {
                let ambient = extract::ambient_reading(&weather);
                let m = &self.metrics;
                self.publish_temperature(
                    outcome,
                    home_id,
                    None,
                    Field::OutsideTemperature,
                    ambient.outside_temperature,
                    |c| m.outside_temperature_celsius.set(c),
                    |f| m.outside_temperature_fahrenheit.set(f),
                );
                self.publish(
                    outcome,
                    home_id,
                    None,
                    Field::SolarIntensity,
                    ambient.solar_intensity,
                    |v| m.solar_intensity_percentage.set(v),
                );
            }
            None => ok = false,
        }

        ok
    }

    fn collect_zones(&self, home_id: HomeId, deadline: &Deadline, outcome: &mut ScrapeOutcome) -> bool {
        let Some(zones) = self.fetch(outcome, ErrorKind::ZoneList, home_id, "zone list", |u| {
            u.get_zones(home_id, deadline)
        }) else {
            return false;
        };
        let Some(states) = self.fetch(outcome, ErrorKind::ZoneList, home_id, "zone states", |u| {
            u.get_zone_states(home_id, deadline)
        }) else {
            return false;
        };

        for zone in &zones {
            outcome.zones_attempted += 1;
            let Some(zone_id) = zone.id else {
                warn!("Home {}: zone {:?} has no id; skipping", home_id.0, zone.name);
                outcome.zones_failed += 1;
                outcome.push(
                    ErrorKind::ZoneInvalid,
                    Some(home_id),
                    None,
                    format!("zone {:?} has no id", zone.name),
                );
                continue;
            };
            let Some(state) = states.get(zone_id) else {
                warn!(
                    "Home {} zone {} ({}): no state in batch response; skipping",
                    home_id.0,
                    zone_id.0,
                    zone.name.as_deref().unwrap_or("unnamed")
                );
                outcome.zones_failed += 1;
                outcome.push(
                    ErrorKind::ZoneStateMissing,
                    Some(home_id),
                    Some(zone_id),
                    "no state in batch response".to_string(),
                );
                continue;
            };

            let labels = ZoneLabels::new(home_id, zone_id, zone);
            self.record_zone(outcome, home_id, zone_id, &labels, &extract::zone_reading(state));
        }
        true
    }

    fn record_zone(
        &self,
        outcome: &mut ScrapeOutcome,
        home_id: HomeId,
        zone_id: ZoneId,
        labels: &ZoneLabels,
        reading: &ZoneReading,
    ) {
        let m = &self.metrics;
        let lv = labels.values();
        let zone = Some(zone_id);

        self.publish_temperature(
            outcome,
            home_id,
            zone,
            Field::MeasuredTemperature,
            reading.measured_temperature,
            |c| m.measured_temperature_celsius.with_label_values(&lv).set(c),
            |f| m.measured_temperature_fahrenheit.with_label_values(&lv).set(f),
        );
        self.publish(outcome, home_id, zone, Field::Humidity, reading.humidity, |v| {
            m.measured_humidity_percentage.with_label_values(&lv).set(v)
        });
        self.publish_temperature(
            outcome,
            home_id,
            zone,
            Field::TargetTemperature,
            reading.target_temperature,
            |c| m.target_temperature_celsius.with_label_values(&lv).set(c),
            |f| m.target_temperature_fahrenheit.with_label_values(&lv).set(f),
        );
        self.publish(outcome, home_id, zone, Field::HeatingPower, reading.heating_power, |v| {
            m.heating_power_percentage.with_label_values(&lv).set(v)
        });

        m.window_open
            .with_label_values(&lv)
            .set(bool_value(reading.window_open));
        if let Some(on) = reading.device_on {
            m.device_on.with_label_values(&lv).set(bool_value(on));
        }
    }

    fn publish(
        &self,
        outcome: &mut ScrapeOutcome,
        home_id: HomeId,
        zone_id: Option<ZoneId>,
        field: Field,
        value: Option<f64>,
        write: impl FnOnce(f64),
    ) {
        match value.map(|v| field.check(v)) {
            None => {}
            Some(Ok(valid)) => write(valid.value()),
            Some(Err(e)) => Self::reject(outcome, home_id, zone_id, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_temperature(
        &self,
        outcome: &mut ScrapeOutcome,
        home_id: HomeId,
        zone_id: Option<ZoneId>,
        field: Field,
        reading: TemperatureReading,
        write_celsius: impl FnOnce(f64),
        write_fahrenheit: impl FnOnce(f64),
    ) {
        match reading.check(field) {
            None => {}
            Some(Ok((celsius, fahrenheit))) => {
                write_celsius(celsius.value());
                if let Some(f) = fahrenheit {
                    write_fahrenheit(f);
                }
            }
            Some(Err(e)) => Self::reject(outcome, home_id, zone_id, e),
        }
    }

    fn reject(outcome: &mut ScrapeOutcome, home_id: HomeId, zone_id: Option<ZoneId>, e: ValidationError) {
        match zone_id {
            Some(zone) => warn!("Home {} zone {}: {}", home_id.0, zone.0, e),
            None => warn!("Home {}: {}", home_id.0, e),
        }
        outcome.push(ErrorKind::Validation, Some(home_id), zone_id, e.to_string());
    }
}

fn bool_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

impl<U: Upstream> Collector for TadoCollector<U> {
    fn desc(&self) -> Vec<&Desc> {
        metrics::describe(self.metrics.collectors().into_iter().chain(self.exporter.collectors()))
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let outcome = self.scrape();
        if !outcome.errors.is_empty() && !outcome.enumeration_failed {
            info!(
                "Scrape served partial data: {} error(s), {} of {} home(s) degraded",
                outcome.errors.len(),
                outcome.homes_failed,
                outcome.homes_attempted
            );
        }
        metrics::gather(self.metrics.collectors().into_iter().chain(self.exporter.collectors()))
    }
}
