use std::path::Path;

use poolkeeper_core::PoolkeeperConfig;

const REDACTED: &str = "<redacted>";

pub fn check(path: &Path) -> anyhow::Result<()> {
    let config = PoolkeeperConfig::from_file(path)?;
    tracing::info!(path = %path.display(), "configuration is valid");
    println!("{}", render(&config)?);
    Ok(())
}

/// The resolved configuration as TOML, with secrets masked.
fn render(config: &PoolkeeperConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if shown.connection.password.is_some() {
        shown.connection.password = Some(REDACTED.to_string());
    }
    Ok(shown.to_toml_string()?)
}
