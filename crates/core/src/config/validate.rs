use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - staging.max_number_of_processors is at least 1
/// - staging.max_queue_size is at least 1
/// - staging.poll_interval_ms is not 0
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let staging = &config.staging;

    if staging.max_number_of_processors == 0 {
        return Err(ConfigError::ValidationError(
            "staging.max_number_of_processors cannot be 0".to_string(),
        ));
    }

    if staging.max_queue_size == 0 {
        return Err(ConfigError::ValidationError(
            "staging.max_queue_size cannot be 0".to_string(),
        ));
    }

    if staging.poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "staging.poll_interval_ms cannot be 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingConfig;

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_processors_fails() {
        let config = Config {
            staging: StagingConfig::default().with_max_processors(0),
            ..Config::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_zero_queue_fails() {
        let config = Config {
            staging: StagingConfig::default().with_max_queue_size(0),
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_poll_interval_fails() {
        let config = Config {
            staging: StagingConfig::default().with_poll_interval_ms(0),
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
