//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::Config;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Convert the first error into a [`ConfigError`].
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(ConfigError::InvalidValue {
                field: err.path,
                message: err.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_queue(config, &mut result);
        Self::validate_scheduler(config, &mut result);
        Self::validate_logging(config, &mut result);

        result
    }

    fn validate_queue(config: &Config, result: &mut ValidationResult) {
        let queue = &config.queue;

        if queue.max_workers == 0 {
            result.add_error(ValidationError::new(
                "queue.max_workers",
                "max_workers must be greater than 0",
            ));
        }

        if queue.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "queue.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }

        if queue.event_capacity == 0 {
            result.add_error(ValidationError::new(
                "queue.event_capacity",
                "event_capacity must be greater than 0",
            ));
        }

        if queue.retry_delay_base_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "queue.retry_delay_base_ms",
                "retry delay base is 0, failed jobs will be retried immediately",
            ));
        }

        if queue.job_timeout_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "queue.job_timeout_secs",
                "job timeout disabled, a hung handler will hold its worker forever",
            ));
        }
    }

    fn validate_scheduler(config: &Config, result: &mut ValidationResult) {
        if config.scheduler.tick_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "scheduler.tick_interval_secs",
                "tick_interval_secs must be greater than 0",
            ));
        }

        if config.scheduler.tick_interval_secs > 60 {
            result.add_warning(ValidationWarning::new(
                "scheduler.tick_interval_secs",
                "tick interval above 60s, minute-resolution schedules will fire late",
            ));
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        let level = config.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            result.add_error(ValidationError::new(
                "logging.level",
                format!(
                    "Unknown log level '{}', valid values: {:?}",
                    config.logging.level, LOG_LEVELS
                ),
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
