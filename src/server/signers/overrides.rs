//! Request level overrides of signer settings.
//!
//! A signer setting such as detached signing has a configured default and
//! a flag saying whether a client may ask for something else. A client
//! asking for the default is always fine.

use crate::server::context::RequestMetadata;
use crate::server::worker::WorkerConfig;


//------------ Overridable ---------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Overridable<T> {
    pub default: T,
    pub allow_override: bool,
}

/// A client asked for a value different from the default without the
/// override being allowed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OverrideRefused<T>(pub T);

impl<T: Clone + PartialEq> Overridable<T> {
    pub fn new(default: T, allow_override: bool) -> Self {
        Overridable { default, allow_override }
    }

    /// Determines the value to use given what the client asked for.
    pub fn resolve(&self, requested: Option<T>) -> Result<T, OverrideRefused<T>> {
        match requested {
            None => Ok(self.default.clone()),
            Some(value) if value == self.default => Ok(value),
            Some(value) if self.allow_override => Ok(value),
            Some(value) => Err(OverrideRefused(value)),
        }
    }
}

impl Overridable<bool> {
    /// Reads a boolean setting and its override flag.
    ///
    /// Bad values are added to the configuration errors and replaced by
    /// `false`.
    pub fn from_properties(
        config: &WorkerConfig,
        property: &str,
        override_property: &str,
        errors: &mut Vec<String>,
    ) -> Self {
        let mut read = |key: &str| {
            config.get_bool(key, false).unwrap_or_else(|err| {
                errors.push(err);
                false
            })
        };
        let default = read(property);
        let allow_override = read(override_property);
        Overridable { default, allow_override }
    }
}

/// Returns a boolean request metadata value.
///
/// Anything but “true” in any case counts as false, an empty value as not
/// given.
pub fn requested_bool(metadata: &RequestMetadata, key: &str) -> Option<bool> {
    metadata.get(key).map(|value| value.eq_ignore_ascii_case("true"))
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_resolution() {
        for default in [false, true] {
            for allow in [false, true] {
                let setting = Overridable::new(default, allow);
                assert_eq!(setting.resolve(None), Ok(default));
                assert_eq!(setting.resolve(Some(default)), Ok(default));
                let other = !default;
                if allow {
                    assert_eq!(setting.resolve(Some(other)), Ok(other));
                }
                else {
                    assert_eq!(
                        setting.resolve(Some(other)), Err(OverrideRefused(other))
                    );
                }
            }
        }
    }

    #[test]
    fn empty_metadata_counts_as_absent() {
        let mut metadata = RequestMetadata::default();
        metadata.insert("DETACHEDSIGNATURE", "");
        assert_eq!(requested_bool(&metadata, "DETACHEDSIGNATURE"), None);
        metadata.insert("DETACHEDSIGNATURE", "TRUE");
        assert_eq!(requested_bool(&metadata, "detachedsignature"), Some(true));
        metadata.insert("DETACHEDSIGNATURE", "yes");
        assert_eq!(requested_bool(&metadata, "DETACHEDSIGNATURE"), Some(false));
    }

    #[test]
    fn bad_boolean_properties() {
        let config: WorkerConfig = [
            ("DETACHEDSIGNATURE", "maybe"),
            ("ALLOW_DETACHEDSIGNATURE_OVERRIDE", "TRUE"),
        ].into_iter().collect();
        let mut errors = Vec::new();
        let setting = Overridable::from_properties(
            &config,
            "DETACHEDSIGNATURE",
            "ALLOW_DETACHEDSIGNATURE_OVERRIDE",
            &mut errors
        );
        assert_eq!(
            errors,
            ["Incorrect value for property DETACHEDSIGNATURE. \
              Expecting TRUE or FALSE."]
        );
        assert_eq!(setting, Overridable::new(false, true));
    }
}
