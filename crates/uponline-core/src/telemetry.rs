//! Telemetry samples and the normalizer
//!
//! Producers push `{entity_id, metric_kind, value, timestamp}` samples. The
//! normalizer resolves the entity against the topology, checks that the
//! metric applies to that kind of entity and that the value lies within the
//! configured physical range, and produces a [`Reading`] addressed by stable
//! arena index.

use crate::config::MetricRanges;
use crate::topology::Topology;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of entity a metric is reported for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Rack,
    Node,
    Crah,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Rack => write!(f, "rack"),
            EntityKind::Node => write!(f, "node"),
            EntityKind::Crah => write!(f, "crah"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Rack inlet temperature, °C
    InletTemperature,
    /// Rack power draw, kW
    PowerDraw,
    /// Hottest GPU on a node, °C
    GpuTemperature,
    /// Node GPU utilization, %
    GpuUtilization,
    /// Node GPU memory usage, %
    MemoryUsage,
    /// Healthy NVLink lanes, %
    NvlinkHealth,
    /// XID errors since boot
    XidErrors,
    /// CRAH supply air temperature, °C
    SupplyTemperature,
}

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::InletTemperature,
        MetricKind::PowerDraw,
        MetricKind::GpuTemperature,
        MetricKind::GpuUtilization,
        MetricKind::MemoryUsage,
        MetricKind::NvlinkHealth,
        MetricKind::XidErrors,
        MetricKind::SupplyTemperature,
    ];

    /// The only kind of entity this metric may be reported for
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            MetricKind::InletTemperature | MetricKind::PowerDraw => EntityKind::Rack,
            MetricKind::SupplyTemperature => EntityKind::Crah,
            _ => EntityKind::Node,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::InletTemperature => "inlet_temperature",
            MetricKind::PowerDraw => "power_draw",
            MetricKind::GpuTemperature => "gpu_temperature",
            MetricKind::GpuUtilization => "gpu_utilization",
            MetricKind::MemoryUsage => "memory_usage",
            MetricKind::NvlinkHealth => "nvlink_health",
            MetricKind::XidErrors => "xid_errors",
            MetricKind::SupplyTemperature => "supply_temperature",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::InletTemperature
            | MetricKind::GpuTemperature
            | MetricKind::SupplyTemperature => "°C",
            MetricKind::PowerDraw => "kW",
            MetricKind::GpuUtilization | MetricKind::MemoryUsage | MetricKind::NvlinkHealth => "%",
            MetricKind::XidErrors => "count",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_sample("-", s, "unknown metric kind"))
    }
}

/// A raw telemetry sample as pushed by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub entity_id: String,
    pub metric_kind: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(
        entity_id: impl Into<String>,
        metric_kind: MetricKind,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_kind,
            value,
            timestamp,
        }
    }
}

/// Arena address of a telemetry-bearing entity, in topology order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Rack(usize),
    Node(usize),
    Crah { zone: usize, unit: usize },
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Rack(_) => EntityKind::Rack,
            EntityRef::Node(_) => EntityKind::Node,
            EntityRef::Crah { .. } => EntityKind::Crah,
        }
    }
}

/// A validated sample addressed by arena index
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub entity: EntityRef,
    pub entity_id: String,
    pub metric: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Resolves and range-checks samples against one topology version
#[derive(Debug, Clone)]
pub struct Normalizer {
    entities: HashMap<String, EntityRef>,
    ranges: MetricRanges,
}

impl Normalizer {
    /// Index every rack, node and CRAH unit. Ids must be unique across the
    /// three namespaces since samples carry a bare entity id.
    pub fn new(topology: &Topology, ranges: MetricRanges) -> Result<Self> {
        let mut entities = HashMap::new();

        let racks = topology
            .racks
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.to_string(), EntityRef::Rack(i)));
        let nodes = topology
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.hostname.to_string(), EntityRef::Node(i)));
        let crahs = topology
            .cooling_zones
            .iter()
            .enumerate()
            .flat_map(|(zone, z)| {
                z.crah_units
                    .iter()
                    .enumerate()
                    .map(move |(unit, u)| (u.name.to_string(), EntityRef::Crah { zone, unit }))
            });

        for (id, entity) in racks.chain(nodes).chain(crahs) {
            if let Some(existing) = entities.insert(id.clone(), entity) {
                return Err(Error::topology(format!(
                    "telemetry entity id {} is used by both a {} and a {}",
                    id,
                    existing.kind(),
                    entity.kind()
                )));
            }
        }

        Ok(Self { entities, ranges })
    }

    pub fn resolve(&self, entity_id: &str) -> Option<EntityRef> {
        self.entities.get(entity_id).copied()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Normalize a sample. Ordering against previously accepted samples is
    /// enforced by the owner of the entity's state, not here.
    pub fn normalize(&self, sample: &TelemetrySample) -> Result<Reading> {
        let entity = self
            .resolve(&sample.entity_id)
            .ok_or_else(|| Error::unknown_entity(&sample.entity_id))?;

        let metric = sample.metric_kind;
        if metric.entity_kind() != entity.kind() {
            return Err(Error::invalid_sample(
                &sample.entity_id,
                metric.as_str(),
                format!(
                    "{} is a {} metric but the entity is a {}",
                    metric,
                    metric.entity_kind(),
                    entity.kind()
                ),
            ));
        }

        if !sample.value.is_finite() {
            return Err(Error::invalid_sample(
                &sample.entity_id,
                metric.as_str(),
                "value is not a finite number",
            ));
        }

        let range = self.range_for(metric);
        if !range.contains(sample.value) {
            return Err(Error::invalid_sample(
                &sample.entity_id,
                metric.as_str(),
                format!(
                    "value {} {} outside accepted range [{}, {}]",
                    sample.value,
                    metric.unit(),
                    range.min,
                    range.max
                ),
            ));
        }

        Ok(Reading {
            entity,
            entity_id: sample.entity_id.clone(),
            metric,
            value: sample.value,
            timestamp: sample.timestamp,
        })
    }

    fn range_for(&self, metric: MetricKind) -> crate::config::ValueRange {
        match metric {
            MetricKind::InletTemperature => self.ranges.inlet_temperature_c,
            MetricKind::PowerDraw => self.ranges.power_draw_kw,
            MetricKind::GpuTemperature => self.ranges.gpu_temperature_c,
            MetricKind::GpuUtilization | MetricKind::MemoryUsage | MetricKind::NvlinkHealth => {
                self.ranges.percent
            }
            MetricKind::XidErrors => self.ranges.xid_errors,
            MetricKind::SupplyTemperature => self.ranges.supply_temperature_c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn topology() -> Topology {
        Topology::from_yaml_str(
            r#"
racks:
  - { id: B3, row: B, position: 3, gpu_count: 8, cooling_zone: Zone B, pdu: PDU-B3 }
cooling_zones:
  - name: Zone B
    crah_units:
      - { name: CRAH-3, rated_capacity_kw: 45.0, setpoint_c: 22.0 }
power_domains:
  - { id: PDU-B3, kind: Pdu, rated_capacity_kw: 20.0 }
clusters:
  - { name: beta, gpu_model: H100 SXM }
nodes:
  - { hostname: beta-node-07, cluster: beta, rack: B3 }
"#,
        )
        .unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(&topology(), MetricRanges::default()).unwrap()
    }

    fn sample(entity: &str, metric: MetricKind, value: f64) -> TelemetrySample {
        TelemetrySample::new(entity, metric, value, Utc::now())
    }

    #[test]
    fn test_resolves_entities_by_kind() {
        let n = normalizer();
        assert_eq!(n.entity_count(), 3);
        assert_eq!(n.resolve("B3"), Some(EntityRef::Rack(0)));
        assert_eq!(n.resolve("beta-node-07"), Some(EntityRef::Node(0)));
        assert_eq!(n.resolve("CRAH-3"), Some(EntityRef::Crah { zone: 0, unit: 0 }));
    }

    #[test]
    fn test_accepts_valid_sample() {
        let reading = normalizer()
            .normalize(&sample("B3", MetricKind::InletTemperature, 38.4))
            .unwrap();
        assert_eq!(reading.entity, EntityRef::Rack(0));
        assert_eq!(reading.value, 38.4);
    }

    #[test]
    fn test_rejects_unknown_entity() {
        let err = normalizer()
            .normalize(&sample("Z9", MetricKind::PowerDraw, 5.0))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(ref id) if id == "Z9"));
    }

    #[test]
    fn test_rejects_metric_for_wrong_entity_kind() {
        let err = normalizer()
            .normalize(&sample("beta-node-07", MetricKind::PowerDraw, 5.0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSample { .. }));
        assert!(err.to_string().contains("rack metric"));
    }

    #[test]
    fn test_rejects_non_finite_and_out_of_range() {
        let n = normalizer();
        assert!(n
            .normalize(&sample("B3", MetricKind::InletTemperature, f64::NAN))
            .is_err());
        assert!(n
            .normalize(&sample("B3", MetricKind::PowerDraw, -1.0))
            .is_err());
        assert!(n
            .normalize(&sample("beta-node-07", MetricKind::NvlinkHealth, 101.0))
            .is_err());
        assert!(n
            .normalize(&sample("CRAH-3", MetricKind::SupplyTemperature, 18.0))
            .is_ok());
    }

    #[test]
    fn test_rejects_colliding_entity_ids() {
        let mut topology = topology();
        topology.nodes[0].hostname = "B3".into();
        assert!(Normalizer::new(&topology, MetricRanges::default()).is_err());
    }

    #[test]
    fn test_metric_kind_parsing_and_wire_format() {
        assert_eq!(
            "GPU_TEMPERATURE".parse::<MetricKind>().unwrap(),
            MetricKind::GpuTemperature
        );
        assert!("humidity".parse::<MetricKind>().is_err());

        let json = r#"{"entity_id":"B3","metric_kind":"inlet_temperature","value":38.4,"timestamp":"2026-03-02T10:00:00Z"}"#;
        let parsed: TelemetrySample = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.metric_kind, MetricKind::InletTemperature);
    }
}
