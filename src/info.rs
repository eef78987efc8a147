//! Info objects for passing hints to runtime operations.
//!
//! [`Info`] is an ordered string-to-string map. Keys from the recognised-key
//! table carry meaning for spawn and port operations; any other key is kept
//! verbatim and has no effect. [`SpawnHints`] and [`PortHints`] are the typed
//! views that validate recognised values.
//!
//! # Example
//!
//! ```
//! use mpirt::Info;
//!
//! let mut info = Info::new();
//! info.set("soft", "1:4").unwrap();
//! info.set("host", "node07").unwrap();
//! assert_eq!(info.get("host"), Some("node07"));
//! assert_eq!(info.nkeys(), 2);
//! ```

use crate::error::{Error, Result};
use crate::{MAX_INFO_KEY, MAX_INFO_VAL};

/// Keys with a defined meaning.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "path",
    "host",
    "wdir",
    "env",
    "hosts",
    "machinefile",
    "localonly",
    "priority",
    "access_style",
    "ip_port",
    "ip_address",
    "soft",
    "map",
    "exitcodes",
    "log",
];

/// An ordered set of key/value hints.
///
/// Use [`Info::null()`] where no hints are supplied. A null info reads as
/// empty but rejects [`set`](Self::set).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    entries: Vec<(String, String)>,
    is_null: bool,
}

impl Info {
    /// Create a new empty info object.
    pub fn new() -> Self {
        Info::default()
    }

    /// The null info object (no hints).
    ///
    /// ```
    /// use mpirt::Info;
    ///
    /// let info = Info::null();
    /// assert!(info.is_null());
    /// assert_eq!(info.get("host"), None);
    /// ```
    pub fn null() -> Self {
        Info {
            entries: Vec::new(),
            is_null: true,
        }
    }

    /// Whether this is the null info object.
    pub fn is_null(&self) -> bool {
        self.is_null
    }

    /// Set a key-value pair. An existing key keeps its position and gets the
    /// new value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInfo`] for the null info object, an empty key, a key
    /// longer than [`MAX_INFO_KEY`], a value longer than [`MAX_INFO_VAL`], or
    /// either containing a null byte.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if self.is_null {
            return Err(Error::InvalidInfo(
                "cannot set key-value on MPI_INFO_NULL".into(),
            ));
        }
        let key = key.trim();
        if key.is_empty() || key.len() > MAX_INFO_KEY {
            return Err(Error::InvalidInfo(format!(
                "info key length must be 1..={MAX_INFO_KEY}"
            )));
        }
        if value.len() > MAX_INFO_VAL {
            return Err(Error::InvalidInfo(format!(
                "info value for '{key}' longer than {MAX_INFO_VAL}"
            )));
        }
        if key.contains('\0') || value.contains('\0') {
            return Err(Error::InvalidInfo("info key or value contains null byte".into()));
        }
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Value for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove `key`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInfo`] if the key is not present.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|(k, _)| k == key)
            .ok_or_else(|| Error::InvalidInfo(format!("info key '{key}' not set")))?;
        self.entries.remove(idx);
        Ok(())
    }

    /// Number of keys set.
    pub fn nkeys(&self) -> usize {
        self.entries.len()
    }

    /// The `n`th key in insertion order.
    pub fn nth_key(&self, n: usize) -> Option<&str> {
        self.entries.get(n).map(|(k, _)| k.as_str())
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether `key` belongs to the recognised-key table.
    pub fn is_recognized(key: &str) -> bool {
        RECOGNIZED_KEYS.contains(&key)
    }
}

/// One `a[:b[:s]]` range of the `soft` spawn hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SoftRange {
    low: usize,
    high: usize,
    stride: usize,
}

/// Process counts acceptable to a soft spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftCounts {
    ranges: Vec<SoftRange>,
}

impl SoftCounts {
    /// Parse a comma separated list of `a`, `a:b` or `a:b:s` triplets.
    pub fn parse(value: &str) -> Result<Self> {
        let bad = || Error::InvalidInfo(format!("malformed soft value '{value}'"));
        let number = |s: &str| s.trim().parse::<usize>().map_err(|_| bad());
        let mut ranges = Vec::new();
        for part in value.split(',').filter(|p| !p.trim().is_empty()) {
            let fields: Vec<&str> = part.split(':').collect();
            let range = match fields.as_slice() {
                [a] => {
                    let a = number(a)?;
                    SoftRange {
                        low: a,
                        high: a,
                        stride: 1,
                    }
                }
                [a, b] => SoftRange {
                    low: number(a)?,
                    high: number(b)?,
                    stride: 1,
                },
                [a, b, s] => SoftRange {
                    low: number(a)?,
                    high: number(b)?,
                    stride: number(s)?,
                },
                _ => return Err(bad()),
            };
            if range.high < range.low || range.stride == 0 {
                return Err(bad());
            }
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err(bad());
        }
        Ok(SoftCounts { ranges })
    }

    /// Whether spawning exactly `count` processes is acceptable.
    pub fn allows(&self, count: usize) -> bool {
        self.ranges.iter().any(|r| {
            count >= r.low && count <= r.high && (count - r.low) % r.stride == 0
        })
    }

    /// Largest acceptable count not exceeding `limit`.
    pub fn largest_within(&self, limit: usize) -> Option<usize> {
        (0..=limit).rev().find(|&m| self.allows(m))
    }
}

/// Typed view of the hints relevant to spawning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnHints {
    /// Soft process counts; `None` requests the hard policy.
    pub soft: Option<SoftCounts>,
    /// Preferred host.
    pub host: Option<String>,
    /// Working directory for the children.
    pub wdir: Option<String>,
    /// Search path for the command.
    pub path: Option<String>,
    /// `NAME=VALUE` environment additions.
    pub env: Vec<(String, String)>,
    /// Keep children on the spawning host.
    pub localonly: bool,
}

impl SpawnHints {
    /// Validate the spawn-related keys of `info`.
    pub fn from_info(info: &Info) -> Result<Self> {
        let mut hints = SpawnHints::default();
        if let Some(soft) = info.get("soft") {
            hints.soft = Some(SoftCounts::parse(soft)?);
        }
        hints.host = info.get("host").map(str::to_string);
        hints.wdir = info.get("wdir").map(str::to_string);
        hints.path = info.get("path").map(str::to_string);
        if let Some(env) = info.get("env") {
            for assignment in env.split_whitespace() {
                let (name, value) = assignment.split_once('=').ok_or_else(|| {
                    Error::InvalidInfo(format!("env entry '{assignment}' is not NAME=VALUE"))
                })?;
                if name.is_empty() {
                    return Err(Error::InvalidInfo(format!(
                        "env entry '{assignment}' has an empty name"
                    )));
                }
                hints.env.push((name.to_string(), value.to_string()));
            }
        }
        if let Some(flag) = info.get("localonly") {
            hints.localonly = parse_flag("localonly", flag)?;
        }
        if let Some(priority) = info.get("priority") {
            priority.trim().parse::<i32>().map_err(|_| {
                Error::InvalidInfo(format!("priority '{priority}' is not an integer"))
            })?;
        }
        Ok(hints)
    }
}

/// Typed view of the hints relevant to opening a port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortHints {
    /// Requested port number.
    pub ip_port: Option<u16>,
    /// Requested listening address.
    pub ip_address: Option<String>,
}

impl PortHints {
    /// Validate the port-related keys of `info`.
    pub fn from_info(info: &Info) -> Result<Self> {
        let ip_port = info
            .get("ip_port")
            .map(|p| {
                p.trim()
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidInfo(format!("ip_port '{p}' is not a port number")))
            })
            .transpose()?;
        let ip_address = info.get("ip_address").map(str::to_string);
        if let Some(addr) = &ip_address {
            if addr.is_empty() || addr.contains('$') || addr.contains('#') {
                return Err(Error::InvalidInfo(format!("ip_address '{addr}' is malformed")));
            }
        }
        Ok(PortHints {
            ip_port,
            ip_address,
        })
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(Error::InvalidInfo(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_info_set_returns_error() {
        let mut info = Info::null();
        let err = info.set("key", "value").unwrap_err();
        assert!(matches!(err, Error::InvalidInfo(_)));
        assert!(format!("{err}").contains("MPI_INFO_NULL"), "got: {err}");
        assert_eq!(info.get("key"), None);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut info = Info::new();
        info.set("a", "1").unwrap();
        info.set("b", "2").unwrap();
        info.set("a", "3").unwrap();
        let pairs: Vec<_> = info.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
        assert_eq!(info.nth_key(1), Some("b"));
    }

    #[test]
    fn key_and_value_limits() {
        let mut info = Info::new();
        assert!(info.set("", "v").is_err());
        assert!(info.set(&"k".repeat(MAX_INFO_KEY + 1), "v").is_err());
        assert!(info.set("k", &"v".repeat(MAX_INFO_VAL + 1)).is_err());
        assert!(info.set("key\0bad", "v").is_err());
        assert!(info.set(&"k".repeat(MAX_INFO_KEY), &"v".repeat(MAX_INFO_VAL)).is_ok());
    }

    #[test]
    fn unrecognized_keys_are_kept() {
        let mut info = Info::new();
        info.set("vendor_tuning", "fast").unwrap();
        assert!(!Info::is_recognized("vendor_tuning"));
        assert!(Info::is_recognized("ip_port"));
        assert_eq!(info.get("vendor_tuning"), Some("fast"));
        info.delete("vendor_tuning").unwrap();
        assert!(info.delete("vendor_tuning").is_err());
    }

    #[test]
    fn soft_counts() {
        let soft = SoftCounts::parse("1,4:8:2").unwrap();
        assert!(soft.allows(1));
        assert!(soft.allows(6));
        assert!(!soft.allows(5));
        assert!(!soft.allows(10));
        assert_eq!(soft.largest_within(7), Some(6));
        assert_eq!(soft.largest_within(3), Some(1));
        assert_eq!(soft.largest_within(0), None);

        for bad in ["", "x", "3:1", "1:4:0", "1:2:3:4"] {
            assert!(SoftCounts::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn spawn_hints_validate() {
        let mut info = Info::new();
        info.set("soft", "0:2").unwrap();
        info.set("env", "A=1 B=two").unwrap();
        info.set("localonly", "yes").unwrap();
        let hints = SpawnHints::from_info(&info).unwrap();
        assert_eq!(hints.soft.unwrap().largest_within(5), Some(2));
        assert_eq!(hints.env.len(), 2);
        assert!(hints.localonly);

        info.set("env", "JUNK").unwrap();
        assert!(matches!(
            SpawnHints::from_info(&info).unwrap_err(),
            Error::InvalidInfo(_)
        ));

        assert_eq!(SpawnHints::from_info(&Info::null()).unwrap(), SpawnHints::default());
    }

    #[test]
    fn port_hints_validate() {
        let mut info = Info::new();
        info.set("ip_port", "5000").unwrap();
        assert_eq!(PortHints::from_info(&info).unwrap().ip_port, Some(5000));
        info.set("ip_port", "70000").unwrap();
        assert!(PortHints::from_info(&info).is_err());
    }
}
