use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Power strip access: management-port credentials plus the rack controller
/// endpoint answering which strip addresses exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripSettings {
    /// Management-port login.
    pub username: String,

    /// Management-port password.
    pub password: String,

    /// The capability endpoint queried to discover strip addresses.
    pub capability_url: String,
}

impl StripSettings {
    /// Environment beats the config file for credentials, so they can stay
    /// out of checked-in files.
    pub(crate) fn with_env_overrides(mut self) -> Self {
        if let Ok(username) = std::env::var("STRIP_USERNAME") {
            self.username = username;
        }
        if let Ok(password) = std::env::var("STRIP_PASSWORD") {
            self.password = password;
        }
        self
    }
}

/// The configuration used for running the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the device mapping document lives.
    pub mapping_path: PathBuf,

    /// Directory receiving the system log and the per-device trace files.
    pub log_dir: PathBuf,

    /// Power strip access. Leave out on plain UART racks.
    pub strips: Option<StripSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mapping_path: "devices.json".into(),
            log_dir: "logs".into(),
            strips: None,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            mapping_path: "/etc/slotline/devices.json".into(),
            log_dir: "/var/log/slotline".into(),
            strips: Some(StripSettings {
                username: "admin".into(),
                password: "hunter2".into(),
                capability_url: "http://192.168.100.11/rack/api/v2/router/capability".into(),
            }),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.mapping_path.as_os_str().is_empty() {
            return Err(Error::BadConfig(
                "A path to the mapping document is required".into(),
            ));
        }

        if self.log_dir.as_os_str().is_empty() {
            return Err(Error::BadConfig("A log directory is required".into()));
        }

        if let Some(strips) = &self.strips {
            if strips.username.is_empty() || strips.capability_url.is_empty() {
                return Err(Error::BadConfig(
                    "Strip settings need a username and a capability URL".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_round_trips() {
        let config = Config::example();
        let reparsed = Config::deserialize(&config.serialize_pretty());

        assert_eq!(reparsed.mapping_path, config.mapping_path);
        assert_eq!(reparsed.log_dir, config.log_dir);
        assert!(reparsed.strips.is_some());
    }

    #[test]
    fn strips_section_may_be_left_out() {
        let config = Config::deserialize(
            r#"(
                mapping_path: "devices.json",
                log_dir: "logs",
                strips: None,
            )"#,
        );

        assert!(config.strips.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_paths_fail_validation() {
        let mut config = Config::default();
        config.mapping_path = PathBuf::new();

        assert!(config.validate().is_err());
    }
}
