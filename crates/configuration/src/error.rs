use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read, or its values did not fit the settings types.
    #[error("Could not load settings: {0}")]
    LoadError(#[from] config::ConfigError),

    /// The settings parsed but break a rule between fields.
    #[error("Invalid settings: {0}")]
    ValidationError(String),
}
