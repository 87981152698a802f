//! Worker identity and configuration.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize};


//------------ WorkerIdentifier ----------------------------------------------

/// Identifies a worker either by its numeric id or by its name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum WorkerIdentifier {
    Id(u32),
    Name(String),
}

impl WorkerIdentifier {
    /// Parses an identifier: all digits is an id, anything else a name.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = u32::from_str(s) {
                return WorkerIdentifier::Id(id)
            }
        }
        WorkerIdentifier::Name(s.to_string())
    }
}

impl From<u32> for WorkerIdentifier {
    fn from(id: u32) -> Self {
        WorkerIdentifier::Id(id)
    }
}

impl From<&str> for WorkerIdentifier {
    fn from(s: &str) -> Self {
        WorkerIdentifier::parse(s)
    }
}

impl fmt::Display for WorkerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkerIdentifier::Id(id) => write!(f, "{id}"),
            WorkerIdentifier::Name(name) => f.write_str(name),
        }
    }
}


//------------ WorkerType ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Timestamp,
    Cms,
    Xml,
    Dispatcher,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            WorkerType::Timestamp => "timestamp",
            WorkerType::Cms => "cms",
            WorkerType::Xml => "xml",
            WorkerType::Dispatcher => "dispatcher",
        })
    }
}


//------------ WorkerConfig --------------------------------------------------

/// The properties of a worker.
///
/// Property names are case insensitive and kept upper case.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct WorkerConfig {
    properties: BTreeMap<String, String>,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(&key.to_uppercase()).map(String::as_str)
    }

    /// Returns the trimmed value if it is not empty.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(&key.to_uppercase())
    }

    /// Returns a TRUE/FALSE property.
    ///
    /// An absent or empty property gives the default, anything other than
    /// “true” or “false” (in any case) gives an error message.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.get_non_empty(key) {
            None => Ok(default),
            Some(value) => parse_bool(value).ok_or_else(|| {
                format!(
                    "Incorrect value for property {}. Expecting TRUE or FALSE.",
                    key.to_uppercase()
                )
            })
        }
    }

    /// Returns a TRUE/FALSE property, treating anything but TRUE as false.
    pub fn is_true(&self, key: &str) -> bool {
        self.get_non_empty(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_uppercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.properties.remove(&key.to_uppercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates over all properties starting with a prefix.
    ///
    /// Returns the rest of the key after the prefix and the value.
    pub fn with_prefix<'a>(
        &'a self, prefix: &'a str
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix).map(|rest| (rest, v))
        })
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for WorkerConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut res = WorkerConfig::new();
        for (k, v) in iter {
            res.set(k.as_ref(), v);
        }
        res
    }
}

impl<'de> Deserialize<'de> for WorkerConfig {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(d)?;
        Ok(map.into_iter().collect())
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    if value.trim().eq_ignore_ascii_case("true") {
        Some(true)
    }
    else if value.trim().eq_ignore_ascii_case("false") {
        Some(false)
    }
    else {
        None
    }
}


//------------ Property Names ------------------------------------------------

/// Names of the properties understood by all workers.
pub mod props {
    pub const DISABLED: &str = "DISABLED";
    pub const KEYUSAGELIMIT: &str = "KEYUSAGELIMIT";
    pub const DISABLEKEYUSAGECOUNTER: &str = "DISABLEKEYUSAGECOUNTER";
    pub const AUTHTYPE: &str = "AUTHTYPE";
    pub const CACHE_PRIVATEKEY: &str = "CACHE_PRIVATEKEY";
    pub const NOCERTIFICATES: &str = "NOCERTIFICATES";
    pub const WORKERLOGGER: &str = "WORKERLOGGER";
    pub const LOGFILE: &str = "LOGFILE";
    pub const ARCHIVE: &str = "ARCHIVE";
    pub const ACCOUNTER: &str = "ACCOUNTER";
    pub const CHECKCERTVALIDITY: &str = "CHECKCERTVALIDITY";
    pub const CHECKCERTPRIVATEKEYVALIDITY: &str = "CHECKCERTPRIVATEKEYVALIDITY";
    pub const MINREMAININGCERTVALIDITY: &str = "MINREMAININGCERTVALIDITY";
    pub const DEFAULTKEY: &str = "DEFAULTKEY";
    pub const CRYPTOTOKEN: &str = "CRYPTOTOKEN";
    pub const SIGNATUREALGORITHM: &str = "SIGNATUREALGORITHM";
    pub const INCLUDESTATUSSTRING: &str = "INCLUDESTATUSSTRING";
}


//------------ Tests ---------------------------------------------------------
