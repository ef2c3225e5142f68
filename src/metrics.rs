//! Prometheus metric families exposed by the exporter.
//!
//! [`TadoMetrics`] holds the domain gauges written from validated readings; [`ExporterMetrics`]
//! describes the exporter's own health. Both are built once at startup and handed to the
//! collector; nothing here is a global.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts};

use crate::models::tado::{HomeId, Zone, ZoneId};
use crate::utils::serde_enum_name;

pub const ZONE_LABELS: [&str; 4] = ["home_id", "zone_id", "zone_name", "zone_type"];

const SCRAPE_DURATION_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0];

/// Unlabeled gauge that is only exported once it has been written.
///
/// A plain `Gauge` starts out exported at 0, which would publish a reading that was never made.
pub struct SparseGauge(GaugeVec);

impl SparseGauge {
    fn new(name: &str, help: &str) -> prometheus::Result<Self> {
        Ok(SparseGauge(GaugeVec::new(Opts::new(name, help), &[])?))
    }

    pub fn set(&self, value: f64) {
        self.0.with_label_values(&[]).set(value);
    }

    pub fn inner(&self) -> &GaugeVec {
        &self.0
    }
}

/// Label values identifying one zone; every zone gauge carries all four.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneLabels {
    pub home_id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub zone_type: String,
}

impl ZoneLabels {
    pub fn new(home_id: HomeId, zone_id: ZoneId, zone: &Zone) -> Self {
        ZoneLabels {
            home_id: home_id.0.to_string(),
            zone_id: zone_id.0.to_string(),
            zone_name: zone.name.clone().unwrap_or_default(),
            zone_type: zone.r#type.as_ref().and_then(serde_enum_name).unwrap_or_default(),
        }
    }

    pub fn values(&self) -> [&str; 4] {
        [&self.home_id, &self.zone_id, &self.zone_name, &self.zone_type]
    }
}

fn zone_gauge(name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help), &ZONE_LABELS)
}

pub struct TadoMetrics {
    pub resident_present: SparseGauge,
    pub solar_intensity_percentage: SparseGauge,
    pub outside_temperature_celsius: SparseGauge,
    pub outside_temperature_fahrenheit: SparseGauge,

    pub measured_temperature_celsius: GaugeVec,
    pub measured_temperature_fahrenheit: GaugeVec,
    pub measured_humidity_percentage: GaugeVec,
    pub target_temperature_celsius: GaugeVec,
    pub target_temperature_fahrenheit: GaugeVec,
    pub heating_power_percentage: GaugeVec,
    pub window_open: GaugeVec,
    pub device_on: GaugeVec,
}

impl TadoMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(TadoMetrics {
            resident_present: SparseGauge::new(
                "tado_home_resident_present",
                "Whether anyone is at home according to tado geofencing (1 home, 0 away)",
            )?,
            solar_intensity_percentage: SparseGauge::new(
                "tado_home_solar_intensity_percentage",
                "Solar intensity at the home location in percent",
            )?,
            outside_temperature_celsius: SparseGauge::new(
                "tado_home_outside_temperature_celsius",
                "Outside temperature at the home location in degrees Celsius",
            )?,
            outside_temperature_fahrenheit: SparseGauge::new(
                "tado_home_outside_temperature_fahrenheit",
                "Outside temperature at the home location in degrees Fahrenheit",
            )?,
            measured_temperature_celsius: zone_gauge(
                "tado_zone_measured_temperature_celsius",
                "Temperature measured in the zone in degrees Celsius",
            )?,
            measured_temperature_fahrenheit: zone_gauge(
                "tado_zone_measured_temperature_fahrenheit",
                "Temperature measured in the zone in degrees Fahrenheit",
            )?,
            measured_humidity_percentage: zone_gauge(
                "tado_zone_measured_humidity_percentage",
                "Relative humidity measured in the zone in percent",
            )?,
            target_temperature_celsius: zone_gauge(
                "tado_zone_target_temperature_celsius",
                "Temperature the zone is set to in degrees Celsius",
            )?,
            target_temperature_fahrenheit: zone_gauge(
                "tado_zone_target_temperature_fahrenheit",
                "Temperature the zone is set to in degrees Fahrenheit",
            )?,
            heating_power_percentage: zone_gauge(
                "tado_zone_heating_power_percentage",
                "Heating power requested by the zone in percent",
            )?,
            window_open: zone_gauge(
                "tado_zone_window_open",
                "Whether an open window was detected in the zone (1 open, 0 closed)",
            )?,
            device_on: zone_gauge(
                "tado_zone_device_on",
                "Whether the zone's heating or cooling is switched on (1 on, 0 off)",
            )?,
        })
    }

    pub fn collectors(&self) -> [&dyn Collector; 12] {
        [
            self.resident_present.inner(),
            self.solar_intensity_percentage.inner(),
            self.outside_temperature_celsius.inner(),
            self.outside_temperature_fahrenheit.inner(),
            &self.measured_temperature_celsius,
            &self.measured_temperature_fahrenheit,
            &self.measured_humidity_percentage,
            &self.target_temperature_celsius,
            &self.target_temperature_fahrenheit,
            &self.heating_power_percentage,
            &self.window_open,
            &self.device_on,
        ]
    }
}

pub struct ExporterMetrics {
    pub scrape_duration_seconds: Histogram,
    pub scrape_errors_total: IntCounter,
    pub collection_errors_total: IntCounterVec,
    pub authentication_valid: IntGauge,
    pub authentication_errors_total: IntCounter,
    pub last_authentication_success_unixtime: IntGauge,
    pub build_info: IntGaugeVec,
    pub circuit_breaker_state: IntGauge,
}

impl ExporterMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let build_info = IntGaugeVec::new(
            Opts::new("tado_exporter_build_info", "Build information of the exporter; constant 1"),
            &["version", "revision"],
        )?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION"), env!("BUILD_TIME_GIT_HASH")])
            .set(1);

        Ok(ExporterMetrics {
            scrape_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "tado_exporter_scrape_duration_seconds",
                    "Wall-clock time spent collecting metrics from the tado API per scrape",
                )
                .buckets(SCRAPE_DURATION_BUCKETS.to_vec()),
            )?,
            scrape_errors_total: IntCounter::new(
                "tado_exporter_scrape_errors_total",
                "Errors encountered while collecting metrics, across all categories",
            )?,
            collection_errors_total: IntCounterVec::new(
                Opts::new(
                    "tado_exporter_collection_errors_total",
                    "Errors encountered while collecting metrics, by category",
                ),
                &["kind"],
            )?,
            authentication_valid: IntGauge::new(
                "tado_exporter_authentication_valid",
                "Whether the last scrape could enumerate the account's homes (1 valid, 0 invalid)",
            )?,
            authentication_errors_total: IntCounter::new(
                "tado_exporter_authentication_errors_total",
                "Scrapes aborted because the account or its homes could not be resolved",
            )?,
            last_authentication_success_unixtime: IntGauge::new(
                "tado_exporter_last_authentication_success_unixtime",
                "Unix time of the last scrape that resolved the account's homes",
            )?,
            build_info,
            circuit_breaker_state: IntGauge::new(
                "tado_exporter_circuit_breaker_state",
                "State of the upstream circuit breaker (0 closed, 1 open, 2 half-open)",
            )?,
        })
    }

    pub fn collectors(&self) -> [&dyn Collector; 8] {
        [
            &self.scrape_duration_seconds,
            &self.scrape_errors_total,
            &self.collection_errors_total,
            &self.authentication_valid,
            &self.authentication_errors_total,
            &self.last_authentication_success_unixtime,
            &self.build_info,
            &self.circuit_breaker_state,
        ]
    }
}

pub(crate) fn describe<'a>(collectors: impl IntoIterator<Item = &'a dyn Collector>) -> Vec<&'a Desc> {
    collectors.into_iter().flat_map(|c| c.desc()).collect()
}

pub(crate) fn gather<'a>(collectors: impl IntoIterator<Item = &'a dyn Collector>) -> Vec<MetricFamily> {
    collectors.into_iter().flat_map(|c| c.collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tado::ZoneType;

    #[test]
    fn sparse_gauge_is_absent_until_written() {
        let metrics = TadoMetrics::new().unwrap();
        let families = metrics.outside_temperature_celsius.inner().collect();
        assert!(families.iter().all(|mf| mf.get_metric().is_empty()));

        metrics.outside_temperature_celsius.set(12.5);
        let families = metrics.outside_temperature_celsius.inner().collect();
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 12.5);
    }

    #[test]
    fn zone_labels_use_wire_names() {
        let zone = Zone {
            id: Some(ZoneId(10)),
            name: Some("Bedroom".into()),
            r#type: Some(ZoneType::Heating),
            ..Default::default()
        };
        let labels = ZoneLabels::new(HomeId(1), ZoneId(10), &zone);
        assert_eq!(labels.values(), ["1", "10", "Bedroom", "HEATING"]);

        let unnamed = ZoneLabels::new(HomeId(1), ZoneId(11), &Zone::default());
        assert_eq!(unnamed.values(), ["1", "11", "", ""]);
    }

    #[test]
    fn descriptors_are_unique_and_registrable() {
        let domain = TadoMetrics::new().unwrap();
        let exporter = ExporterMetrics::new().unwrap();
        let descs = describe(domain.collectors().into_iter().chain(exporter.collectors()));
        assert_eq!(descs.len(), 20);

        let mut names = descs.iter().map(|d| d.fq_name.clone()).collect::<Vec<_>>();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn build_info_is_constant_one() {
        let exporter = ExporterMetrics::new().unwrap();
        let families = exporter.build_info.collect();
        let metric = &families[0].get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 1.0);
        assert!(
            metric
                .get_label()
                .iter()
                .any(|l| l.get_name() == "version" && l.get_value() == env!("CARGO_PKG_VERSION"))
        );
    }
}
