use crate::config::generate::generate_starter_config;
use crate::config::user_config_path;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> io::Result<()> {
    let config_content = generate_starter_config();
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let config_path = user_config_path().unwrap_or_else(|| PathBuf::from("/etc/tigerscope/config.yml"));
    write_config(&config_content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// Write `config_content` to `path`, refusing to replace an existing file.
pub fn write_config(config_content: &str, path: &Path) -> io::Result<()> {
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "config file already exists at {}; remove it first or use --stdout to print the config",
                path.display()
            ),
        ));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)
}
