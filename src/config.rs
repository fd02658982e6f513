//! Scenario files.
//!
//! A scenario can be described in TOML instead of code:
//!
//! ```toml
//! name = "steady"
//! url = "ws://localhost:8080/ws"
//!
//! [workload]
//! executor = "constant"
//! vus = 100
//! duration = "60s"
//!
//! [session]
//! lifetime = "60s"
//! send_interval = "1s"
//! payload_size = 87
//!
//! [thresholds]
//! ws_errors = ["count==0"]
//! ws_session_duration = ["p(95)<65000"]
//! ```
//!
//! Durations use the k6 notation: a sequence of `<number><unit>` pairs with units
//! `ms`, `s`, `m` and `h` (`"500ms"`, `"1m30s"`, `"1.5s"`).

use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    error::ConfigError,
    executor::ExecutionOptions,
    scenario::{DEFAULT_URL, Scenario, Workload},
    session::SessionProfile,
    threshold::ThresholdSpec,
};

/// On-disk form of a [`Scenario`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    pub workload: Workload,
    #[serde(default)]
    pub session: SessionProfile,
    #[serde(default)]
    pub options: ExecutionOptions,
    /// Metric name to the list of expressions that must hold for it.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

impl ScenarioFile {
    /// Read, parse and validate a scenario file.
    pub fn load(path: impl AsRef<Path>) -> Result<Scenario, ConfigError> {
        let path = path.as_ref();
        tracing::debug!("Loading scenario from {}", path.display());
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)?.into_scenario()
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn into_scenario(self) -> Result<Scenario, ConfigError> {
        let mut thresholds = Vec::new();
        for (metric, exprs) in &self.thresholds {
            for expr in exprs {
                let spec = ThresholdSpec::new(metric, expr)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                thresholds.push(spec);
            }
        }

        let scenario = Scenario::builder()
            .name(self.name)
            .url(self.url.unwrap_or_else(|| DEFAULT_URL.to_string()))
            .workload(self.workload)
            .session(self.session)
            .thresholds(thresholds)
            .options(self.options)
            .build();
        scenario.validate()?;
        Ok(scenario)
    }
}

/// Parse a k6 style duration string.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid(format!("duration `{raw}`: {reason}"));
    let s = raw.trim();
    if s.is_empty() {
        return Err(invalid("empty"));
    }

    let mut nanos = 0.0_f64;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if split == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..split].parse().map_err(|_| invalid("bad number"))?;
        rest = &rest[split..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            other => return Err(invalid(&format!("unknown unit `{other}`"))),
        };
        rest = &rest[unit_len..];
        nanos += (value * unit_nanos).round();
    }

    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Render a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        return "0s".into();
    }
    let (h, rem) = (millis / 3_600_000, millis % 3_600_000);
    let (m, rem) = (rem / 60_000, rem % 60_000);
    let (s, ms) = (rem / 1_000, rem % 1_000);

    let mut out = String::new();
    for (value, unit) in [(h, "h"), (m, "m"), (s, "s"), (ms, "ms")] {
        if value > 0 {
            out.push_str(&format!("{value}{unit}"));
        }
    }
    out
}

/// `#[serde(with = "crate::config::duration")]` for k6 duration strings.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&crate::config::format_duration(*d)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| crate::config::parse_duration(&raw).map_err(D::Error::custom))
                .transpose()
        }
    }
}
