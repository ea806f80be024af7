use ferromerge_core::EngineConfig;

use crate::error::CliError;

/// Print the effective configuration as YAML. The output loads back with
/// `--config`.
pub fn run(config: &EngineConfig) -> Result<(), CliError> {
    let yaml = config.to_yaml()?;
    print!("{yaml}");
    Ok(())
}
