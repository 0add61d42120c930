//! Session launching via the external launcher tool.
//!
//! The launcher is invoked as `gemini-toolbox --remote --detached
//! [options...] [-- [-i] <task>]` from inside the requested project
//! directory. The remote auth secret travels in the child environment, never
//! in the argument vector, so it cannot leak through process listings.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::process::{CommandRunner, RunOptions};
use crate::sandbox;

/// Startup deadline for the launcher tool.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable the launcher reads its remote auth secret from.
const REMOTE_KEY_ENV: &str = "GEMINI_REMOTE_KEY";

/// Launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Launcher tool binary (`gemini-toolbox`).
    pub launcher_bin: String,
    /// Workspace roots a project may be launched from.
    pub roots: Vec<String>,
    /// Directory containing launcher config profiles.
    pub host_config_root: Option<String>,
    /// Value to rebind `HOME` to in the child, when configured.
    pub host_home: Option<String>,
    /// Remote auth secret, injected via the environment.
    pub vpn_auth_key: String,
}

/// Parameters of one launch, as submitted by the dashboard wizard.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchRequest {
    pub project_path: String,
    #[serde(default)]
    pub config_profile: Option<String>,
    #[serde(default = "default_session_type")]
    pub session_type: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_image_variant")]
    pub image_variant: String,
    #[serde(default = "default_true")]
    pub docker_enabled: bool,
    #[serde(default = "default_true")]
    pub ide_enabled: bool,
    #[serde(default)]
    pub worktree_mode: bool,
    #[serde(default)]
    pub worktree_name: Option<String>,
    #[serde(default)]
    pub custom_image: Option<String>,
    #[serde(default)]
    pub docker_args: Option<String>,
}

fn default_session_type() -> String {
    "cli".to_string()
}

fn default_image_variant() -> String {
    "standard".to_string()
}

fn default_true() -> bool {
    true
}

impl LaunchRequest {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            config_profile: None,
            session_type: default_session_type(),
            task: None,
            interactive: false,
            image_variant: default_image_variant(),
            docker_enabled: true,
            ide_enabled: true,
            worktree_mode: false,
            worktree_name: None,
            custom_image: None,
            docker_args: None,
        }
    }
}

/// Structured result of a launch attempt. The caller derives user-visible
/// status from `exit_code`; this type never distinguishes success itself.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The command line that was (or would have been) executed.
    pub command: String,
}

/// Launches sessions through the external launcher tool.
#[derive(Clone)]
pub struct LauncherEngine {
    runner: Arc<dyn CommandRunner>,
    config: LauncherConfig,
}

impl LauncherEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, config: LauncherConfig) -> Self {
        Self { runner, config }
    }

    /// Launch a session for the given request.
    ///
    /// The project path must be inside the sandbox; violation is an
    /// authorization failure before anything is executed. Tool timeouts and
    /// spawn failures are folded into the outcome as `exit_code = -1` so the
    /// caller always receives the full structured result.
    pub async fn launch(&self, request: &LaunchRequest) -> HubResult<LaunchOutcome> {
        let project = sandbox::ensure_allowed(Path::new(&request.project_path), &self.config.roots)?;

        let args = self.build_args(request);
        let command = format!("{} {}", self.config.launcher_bin, args.join(" "));
        info!("Executing: {} in {}", command, project.display());

        let mut opts = RunOptions::with_timeout(LAUNCH_TIMEOUT)
            .cwd(&project)
            .env(REMOTE_KEY_ENV, &self.config.vpn_auth_key);
        if let Some(ref home) = self.config.host_home {
            opts = opts.env("HOME", home);
        }

        match self.runner.run(&self.config.launcher_bin, &args, opts).await {
            Ok(output) => Ok(LaunchOutcome {
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                command,
            }),
            Err(HubError::Timeout { .. }) => Ok(LaunchOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: "Error: Command timed out".to_string(),
                command,
            }),
            Err(e) => Ok(LaunchOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                command,
            }),
        }
    }

    /// Build the launcher argument vector in its fixed option order.
    fn build_args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = vec!["--remote".to_string(), "--detached".to_string()];

        if let Some(ref profile) = request.config_profile {
            let profile_path = match self.config.host_config_root {
                Some(ref root) => Path::new(root).join(profile).display().to_string(),
                None => profile.clone(),
            };
            args.push("--profile".to_string());
            args.push(profile_path);
        }

        if request.session_type == "bash" {
            args.push("--bash".to_string());
        }

        if let Some(ref image) = request.custom_image {
            args.push("--image".to_string());
            args.push(image.clone());
        } else if request.image_variant == "preview" {
            args.push("--preview".to_string());
        }

        if !request.docker_enabled {
            args.push("--no-docker".to_string());
        }
        if !request.ide_enabled {
            args.push("--no-ide".to_string());
        }

        if request.worktree_mode {
            args.push("--worktree".to_string());
            if let Some(ref name) = request.worktree_name {
                args.push("--name".to_string());
                args.push(name.clone());
            }
        }

        if let Some(ref docker_args) = request.docker_args {
            args.push("--docker-args".to_string());
            args.push(docker_args.clone());
        }

        if let Some(ref task) = request.task {
            args.push("--".to_string());
            if request.interactive {
                args.push("-i".to_string());
            }
            args.push(task.clone());
        }

        args
    }
}
