use anyhow::Result;
use runcell_config::ConfigManager;

pub fn handle_config_command(manager: &ConfigManager) -> Result<()> {
    match manager.config_path() {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# no runcell.toml found; showing defaults"),
    }
    print!("{}", manager.config().to_toml_string()?);
    Ok(())
}
