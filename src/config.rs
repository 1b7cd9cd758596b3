//! Embedding configuration (spec.md §6.1)
//!
//! `Config` controls the limits and defaults a `host::Instance` is built
//! with: how long a token may run before `force_cleanup` reclaims it, the
//! max parse depth/input size (reusing the parser's own constants unless
//! overridden), and whether a logger gets installed automatically.

use std::time::Duration;

use crate::parser::types::{MAX_INPUT_SIZE, MAX_PARSER_DEPTH};

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_input_size: usize,
    pub max_parser_depth: usize,
    /// Default timeout a token is armed with if a command doesn't specify
    /// its own (spec.md §4.4). `None` means tokens never time out unless a
    /// handler arms one explicitly.
    pub default_token_timeout: Option<Duration>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self { max_input_size: MAX_INPUT_SIZE, max_parser_depth: MAX_PARSER_DEPTH, default_token_timeout: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub limits: ExecutionLimits,
    /// Installs an `env_logger` subscriber on `Instance::new` when set;
    /// leave unset if the host already owns its own subscriber.
    pub install_logger: bool,
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    pub fn max_input_size(mut self, n: usize) -> Self {
        self.config.limits.max_input_size = n;
        self
    }

    pub fn default_token_timeout(mut self, d: Duration) -> Self {
        self.config.limits.default_token_timeout = Some(d);
        self
    }

    pub fn install_logger(mut self, yes: bool) -> Self {
        self.config.install_logger = yes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ConfigBuilder::new().max_input_size(10).install_logger(true).build();
        assert_eq!(cfg.limits.max_input_size, 10);
        assert!(cfg.install_logger);
    }
}
