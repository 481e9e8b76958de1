//! `tokenloom config` — Configuration management commands.

use tokenloom_config::AppConfig;

/// Print the default configuration as TOML.
pub fn show() {
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    print!("{}", AppConfig::default_toml());
}

pub fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed successfully");

            let mut warnings = Vec::new();

            if config.default_budget == 0 {
                warnings.push("default_budget is 0: every render will evict all prunable content");
            }

            if config.engine.cache_capacity < 64 {
                warnings.push("engine.cache_capacity is very small; expect frequent re-measurement");
            }

            if config.engine.max_depth > 1024 {
                warnings.push("engine.max_depth is very large; runaway components will take long to stop");
            }

            if warnings.is_empty() {
                println!("   All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Budget:        {}", config.default_budget);
            println!("   Cache:         {} entries", config.engine.cache_capacity);
            println!("   Eviction:      {:?}", config.engine.eviction);
            println!("   Measurement:   {:?}", config.engine.measurement_failure);
            println!("   Components:    {:?}", config.engine.component_failure);
            println!("   Max depth:     {}", config.engine.max_depth);
            println!(
                "   Heuristic:     {} chars/token, +{} per message",
                config.measurer.chars_per_token, config.measurer.per_message_overhead
            );
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}
