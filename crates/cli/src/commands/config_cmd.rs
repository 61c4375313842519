//! `llamachat config`: Print the default configuration.

use llamachat_config::AppConfig;

pub fn show() {
    println!(
        "# {}",
        AppConfig::config_dir().join("config.toml").display()
    );
    print!("{}", AppConfig::default_toml());
}
