use anyhow::Result;

use crate::config::Configuration;

pub fn show_config(cfg: &Configuration) -> Result<()> {
    cfg.tunnel.validate()?;
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
