use crate::config::Config;
use crate::docker::client::CliDocker;
use crate::docker::DockerClient;
use crate::errors::Result;
use colored::*;

/// Check the local environment can run fixtures
pub fn run(config: &Config) -> Result<i32> {
    let mut healthy = true;

    println!("{}", "stackrig environment".bold());
    println!("{}", "═".repeat(40));

    match Config::find_config_file(&std::env::current_dir()?) {
        Some(path) => println!("{:<16} {}", "Config:", path.display()),
        None => println!("{:<16} {}", "Config:", "defaults".dimmed()),
    }

    let docker = CliDocker::with_binary(&config.docker.binary);
    if docker.is_available() {
        println!("{:<16} {}", "Docker:", "available".green());
    } else {
        println!("{:<16} {}", "Docker:", "not available".red());
        healthy = false;
    }
    println!("{:<16} {}", "Compose:", docker.compose_variant().as_str());

    match config.ports.range()? {
        Some((start, end)) => println!("{:<16} {}-{}", "Host ports:", start, end),
        None => println!("{:<16} {}", "Host ports:", "ephemeral".dimmed()),
    }

    if healthy {
        println!("{} Ready", "✓".green().bold());
        Ok(0)
    } else {
        println!("{} Docker is required to start fixtures", "⚠".yellow());
        Ok(1)
    }
}
