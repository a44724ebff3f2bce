mod settings;

use config::{Config, Environment, File};
use tracing::warn;

use crate::utils::error::{BridgeError, Result};

pub use settings::{
    BrokerAddress, DEFAULT_PUBLISHER_TABLE_NAME, DEFAULT_SUBSCRIBER_TABLE_NAME,
    DEFAULT_TABLE_NAME, KNOWN_KEYS, PartialSettings, Settings, TlsSettings,
};

/// Loads settings from the optional `config/default` file and `LITEMQTT_*`
/// environment variables, merged with default values.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("LITEMQTT"));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    partial.into_settings()
}

/// Builds settings from `key=value` option strings, as passed to a table
/// adapter at creation time.
///
/// Keys are case-insensitive. Values are trimmed and may be wrapped in single
/// or double quotes. Unrecognized keys are ignored with a warning.
pub fn from_options<S: AsRef<str>>(options: &[S]) -> Result<Settings> {
    let mut builder = Config::builder();

    for option in options {
        let option = option.as_ref();
        let Some((key, value)) = option.split_once('=') else {
            return Err(BridgeError::validation(
                "option",
                format!("{option:?} is not in key=value form"),
            ));
        };
        let key = key.trim().to_lowercase();
        if !KNOWN_KEYS.contains(&key.as_str()) {
            warn!(option = %key, "ignoring unrecognized option");
            continue;
        }
        builder = builder.set_override(key, sanitize_option_value(value))?;
    }

    let partial: PartialSettings = builder.build()?.try_deserialize()?;
    partial.into_settings()
}

/// Trims whitespace and one level of matching quotes.
pub fn sanitize_option_value(value: &str) -> String {
    let value = value.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests;
