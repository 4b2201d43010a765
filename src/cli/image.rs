use crate::cli::connect;
use crate::config::Config;
use crate::docker::DockerClient;
use crate::errors::Result;
use crate::wait::Await;
use colored::*;
use std::time::Duration;

/// Report whether an image is present; with `expect`, wait for that state
///
/// Returns exit code 0 when the image is in the expected state, 1 otherwise.
pub fn present(
    config: &Config,
    reference: &str,
    expect: Option<bool>,
    timeout: Option<Duration>,
) -> Result<i32> {
    let docker = connect(config)?;

    let Some(expected) = expect else {
        let present = docker.image_exists(reference)?;
        println!("{} {}", reference, if present { "present".green() } else { "absent".yellow() });
        return Ok(if present { 0 } else { 1 });
    };

    let timeout = match timeout {
        Some(timeout) => timeout,
        None => config.wait.image_timeout()?,
    };
    let state = if expected { "present" } else { "absent" };
    let what = format!("image '{}' to be {}", reference, state);

    let waiter = Await::at_most(timeout).poll_interval(config.wait.poll_interval()?);
    match waiter.until(&what, || Ok(docker.image_exists(reference)? == expected)) {
        Ok(()) => {
            println!("{} {} is {}", "✓".green().bold(), reference, state);
            Ok(0)
        }
        Err(e) => {
            println!("{} {}", "✗".red().bold(), e);
            Ok(1)
        }
    }
}
