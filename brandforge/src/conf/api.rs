use serde::Deserialize;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub server: Server,
    pub build: Build,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Turns on humanized debug messages, extra debug logging for the webserver and other
    /// convenient features for development. Usually turned on along side log_level=debug.
    pub dev_mode: bool,
    pub log_level: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// The address:port the web service binds to.
    pub bind_address: String,
    pub storage_path: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Build {
    /// How long, in seconds, the http probes used by repository verification and
    /// registry connection tests wait before giving up.
    pub probe_timeout: u64,

    /// Default time-to-live, in seconds, stamped onto build outputs recorded
    /// without an explicit expiry. Zero means outputs never expire.
    pub default_output_expiry: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Kind;

    #[test]
    /// Test that the default api config is properly parsed from the configuration file.
    fn parse_default_config_from_file() {
        let config_src_builder = config::Config::builder();

        let config = Kind::new_api_config();

        // First parse embedded config defaults.
        let default_config_raw = config.default_config();
        let default_config = std::str::from_utf8(&default_config_raw).unwrap();

        let config_src = config_src_builder
            .add_source(config::File::from_str(
                default_config,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let parsed_config = config_src.try_deserialize::<Config>().unwrap();
        let expected_config = Config {
            general: General {
                dev_mode: true,
                log_level: "debug".to_string(),
            },
            server: Server {
                bind_address: "127.0.0.1:8080".to_string(),
                storage_path: "/tmp/brandforge.db".to_string(),
            },
            build: Build {
                probe_timeout: 5,
                default_output_expiry: 2592000,
            },
        };

        assert_eq!(parsed_config, expected_config);
    }
}
