use crate::cli::{connect, run_child};
use crate::config::Config;
use crate::docker::compose::{ComposeStack, RemoveImages};
use crate::errors::{Result, RigError};
use colored::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Options shared by every compose subcommand
pub struct StackOptions {
    pub file: Option<PathBuf>,
    pub project: Option<String>,
    pub build: bool,
    pub remove_images: Option<RemoveImages>,
    pub expose: Vec<String>,
}

/// Parse `service:port`
pub fn parse_exposed(value: &str) -> Result<(String, u16)> {
    let (service, port) = value.rsplit_once(':').ok_or_else(|| {
        RigError::InvalidArgument(format!("Expected 'service:port', got '{}'", value))
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|_| RigError::InvalidArgument(format!("Invalid port in '{}'", value)))?;
    if service.is_empty() {
        return Err(RigError::InvalidArgument(format!("Missing service in '{}'", value)));
    }
    Ok((service.to_string(), port))
}

fn build_stack(config: &Config, options: &StackOptions) -> Result<ComposeStack> {
    let docker = connect(config)?;
    let mut compose_config = config.compose.clone();
    if let Some(file) = &options.file {
        compose_config.file = file.to_string_lossy().to_string();
    }
    if options.build {
        compose_config.build = true;
    }

    let mut stack = ComposeStack::from_config(docker, &compose_config, Path::new("."))?
        .with_poll_interval(config.wait.poll_interval()?);

    if let Some(mode) = options.remove_images {
        stack = stack.with_remove_images(Some(mode));
    }
    if let Some(project) = &options.project {
        stack = stack.with_project_name(project);
    }
    for value in &options.expose {
        let (service, port) = parse_exposed(value)?;
        stack = stack.with_exposed_service(&service, port);
    }
    Ok(stack)
}

fn print_exposed(stack: &ComposeStack, expose: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for value in expose {
        let (service, port) = parse_exposed(value)?;
        let host_port = stack.service_port(&service, port)?;
        let address = format!("{}:{}", stack.service_host(&service), host_port);
        println!("  {} {}:{} -> {}", "•".cyan(), service, port, address.green());

        let key = format!(
            "STACKRIG_{}_{}",
            service.to_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_"),
            port
        );
        env.insert(key, address);
    }
    Ok(env)
}

/// Start a stack and leave it running
pub fn up(config: &Config, options: StackOptions) -> Result<i32> {
    let mut stack = build_stack(config, &options)?;
    println!("Starting compose project '{}'...", stack.project_name().cyan());
    stack.start()?;
    print_exposed(&stack, &options.expose)?;

    let project = stack.keep_running();
    println!(
        "{} Stack is up. Tear it down with: rig compose down -p {}",
        "✓".green().bold(),
        project
    );
    Ok(0)
}

/// Tear down a stack started by `up`
pub fn down(config: &Config, options: StackOptions) -> Result<i32> {
    if options.project.is_none() {
        return Err(RigError::InvalidArgument(
            "compose down needs --project".to_string(),
        ));
    }

    let mut stack = build_stack(config, &options)?.attach_running();
    println!("Stopping compose project '{}'...", stack.project_name().cyan());
    stack.stop()?;
    println!("{} Stack is down", "✓".green().bold());
    Ok(0)
}

/// Start a stack, run a command against it, and tear it down
pub fn run(config: &Config, options: StackOptions, command: Vec<String>) -> Result<i32> {
    let mut stack = build_stack(config, &options)?;
    println!("Starting compose project '{}'...", stack.project_name().cyan());
    stack.start()?;

    let mut env = print_exposed(&stack, &options.expose)?;
    env.insert("STACKRIG_PROJECT".to_string(), stack.project_name().to_string());

    let code = run_child(&command, &env);
    stack.stop()?;
    println!("{} Stack is down", "✓".green().bold());
    code
}
