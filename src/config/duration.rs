use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Duration accepted from the configuration document.
///
/// The JSON form is a string of one or more `<integer><unit>` groups with
/// units `ns`, `ms`, `s`, `m`, `h` (e.g. `"60s"`, `"1m30s"`, `"500ms"`).
/// A bare `"0"` and an absent field both mean zero, and zero means the
/// feature guarded by the duration is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Zero means "disabled" throughout the configuration
    pub fn is_zero(&self) -> bool {
        self.0 == Duration::ZERO
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        ConfigDuration(d)
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {:?}", s))?;
        if digits_end == 0 {
            return Err(format!("expected digits in duration {:?}", s));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|e| format!("bad number in duration {:?}: {}", s, e))?;
        rest = &rest[digits_end..];

        // Longest-match the unit: "ms" and "ns" before bare "m"/"s"
        let (unit_len, unit) = if rest.starts_with("ms") {
            (2, Duration::from_millis(value))
        } else if rest.starts_with("ns") {
            (2, Duration::from_nanos(value))
        } else if rest.starts_with('s') {
            (1, Duration::from_secs(value))
        } else if rest.starts_with('m') {
            (1, Duration::from_secs(value * 60))
        } else if rest.starts_with('h') {
            (1, Duration::from_secs(value * 3600))
        } else {
            return Err(format!("unknown unit in duration {:?}", s));
        };
        rest = &rest[unit_len..];
        total += unit;
    }

    Ok(total)
}

fn format_duration(d: Duration) -> String {
    if d == Duration::ZERO {
        return "0".to_string();
    }
    let nanos = d.subsec_nanos() as u64;
    let secs = d.as_secs();
    let mut out = String::new();
    let (h, rem) = (secs / 3600, secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    if nanos > 0 {
        if nanos % 1_000_000 == 0 {
            out.push_str(&format!("{}ms", nanos / 1_000_000));
        } else {
            out.push_str(&format!("{}ns", nanos));
        }
    }
    out
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string like \"60s\" or \"500ms\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse_duration(v).map(ConfigDuration).map_err(E::custom)
            }

            // Bare integer zero is tolerated for compatibility
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                if v == 0 {
                    Ok(ConfigDuration(Duration::ZERO))
                } else {
                    Err(E::custom("durations must be strings with a unit"))
                }
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
