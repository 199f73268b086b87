use clap::Parser;

use crate::runtime::{
    cli::Cli,
    conf::{Conf, ConfigError},
};

pub mod cli;
pub mod conf;
pub mod pipeline;
pub mod shutdown;

/// Everything the binary resolved at startup.
pub struct Runtime {
    pub conf: Conf,
}

impl Runtime {
    /// Parses the command line and builds the layered configuration from it.
    pub fn new() -> Result<Self, RuntimeError> {
        let cli = Cli::parse();
        let conf = Conf::new(&cli)?;

        Ok(Runtime { conf })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
