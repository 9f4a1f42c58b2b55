/// Fatal at startup: a missing/invalid flag or an unreadable keyfile
/// (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("could not read key file {path}: {source}")]
    UnreadableKeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
