//! Configuration validation run before the listener is bound.

use crate::config::{Config, LogOutputType};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::success();

        Self::validate_timeouts(config, &mut result);
        Self::validate_limits(config, &mut result);
        Self::validate_logging(config, &mut result);

        result
    }

    fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
        if config.connect_timeout_secs == Some(0) {
            result.add_error("connect_timeout_secs must be greater than 0".to_string());
        }
        if config.header_timeout_secs == Some(0) {
            result.add_error("header_timeout_secs must be greater than 0".to_string());
        }
        if config.poll_interval_ms == Some(0) {
            result.add_error("poll_interval_ms must be greater than 0".to_string());
        }

        let relay = config.relay_options();
        match relay.idle_timeout {
            None => result.add_warning(
                "idle_timeout_secs is 0: quiet tunnels are never closed".to_string(),
            ),
            Some(idle) if relay.poll_interval > idle => result.add_warning(format!(
                "poll interval ({:?}) exceeds the tunnel idle timeout ({:?}); idle tunnels close late",
                relay.poll_interval, idle
            )),
            Some(_) => {}
        }
    }

    fn validate_limits(config: &Config, result: &mut ValidationResult) {
        if config.max_connections == Some(0) {
            result.add_error("max_connections must be greater than 0 (omit it for no limit)".to_string());
        }
        if config.max_connections.is_none() {
            result.add_warning("max_connections is not set: concurrent connections are unbounded".to_string());
        }
        if config.max_header_size() < 1024 {
            result.add_error(format!(
                "max_header_size {} is too small, at least 1024 bytes are required",
                config.max_header_size()
            ));
        }
        if config.listen_addr.port() == 0 {
            result.add_warning("listen port 0 binds an ephemeral port".to_string());
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        let Some(targets) = config.logging.as_ref().and_then(|l| l.targets.as_ref()) else {
            return;
        };
        if targets.is_empty() {
            result.add_warning("logging.targets is empty: nothing will be logged".to_string());
        }
        for target in targets {
            if target.output_type == LogOutputType::File && target.path.is_none() {
                result.add_error("file log target requires a path".to_string());
            }
        }
    }
}
