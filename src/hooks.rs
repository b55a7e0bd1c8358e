//! Lifecycle hooks for jail management
//!
//! Provides:
//! - Hook definitions for the start and stop phases
//! - Variable substitution in hook commands
//! - Execution on the host or inside the jail, with a timeout
//! - Configurable failure handling
//!
//! The per-jail `exec_*` properties are turned into hooks as well, so the
//! lifecycle runs one kind of thing at every phase.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::host::HostCommand;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lifecycle phases when hooks can be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    /// On the host, before the jail is created
    PreStart,
    /// Inside the jail, right after creation (exec_start)
    Start,
    /// On the host, after the jail is up
    PostStart,
    /// On the host, before shutdown
    PreStop,
    /// Inside the jail, at shutdown (exec_stop)
    Stop,
    /// On the host, after the jail is removed
    PostStop,
}

impl HookPhase {
    /// Property holding the per-jail command for this phase
    pub fn property(&self) -> &'static str {
        match self {
            HookPhase::PreStart => "exec_prestart",
            HookPhase::Start => "exec_start",
            HookPhase::PostStart => "exec_poststart",
            HookPhase::PreStop => "exec_prestop",
            HookPhase::Stop => "exec_stop",
            HookPhase::PostStop => "exec_poststop",
        }
    }

    /// Where the per-jail command for this phase runs
    pub fn default_target(&self) -> HookTarget {
        match self {
            HookPhase::Start | HookPhase::Stop => HookTarget::Jail,
            _ => HookTarget::Host,
        }
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookPhase::PreStart => "pre_start",
            HookPhase::Start => "start",
            HookPhase::PostStart => "post_start",
            HookPhase::PreStop => "pre_stop",
            HookPhase::Stop => "stop",
            HookPhase::PostStop => "post_stop",
        };
        write!(f, "{}", s)
    }
}

/// Where to execute the hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookTarget {
    /// Execute on the host system
    #[default]
    Host,
    /// Execute inside the jail (requires running jail)
    Jail,
}

/// What to do when a hook fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the operation (default)
    #[default]
    Abort,
    /// Log and continue
    Continue,
}

/// A lifecycle hook definition
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    /// Lifecycle phase to execute at
    pub phase: HookPhase,

    /// Where to execute (host or jail)
    #[serde(default)]
    pub target: HookTarget,

    /// Command to execute
    pub command: String,

    /// Arguments (supports variable substitution)
    #[serde(default)]
    pub args: Vec<String>,

    /// Timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// What to do on failure
    #[serde(default)]
    pub on_failure: OnFailure,

    /// Optional description for logging
    pub description: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

impl Hook {
    pub fn new(phase: HookPhase, command: impl Into<String>) -> Self {
        Self {
            phase,
            target: phase.default_target(),
            command: command.into(),
            args: Vec::new(),
            timeout: default_timeout(),
            on_failure: OnFailure::Abort,
            description: None,
        }
    }

    /// Hook for a per-jail `exec_*` property (a shell command line)
    ///
    /// Returns None for the no-op values `none` and `/usr/bin/true`.
    pub fn from_property(phase: HookPhase, command_line: &str, timeout: u64) -> Option<Self> {
        let line = command_line.trim();
        if line.is_empty() || line == "none" || line == "/usr/bin/true" {
            return None;
        }
        Some(Self {
            args: vec!["-c".to_string(), line.to_string()],
            timeout,
            description: Some(phase.property().to_string()),
            ..Self::new(phase, "/bin/sh")
        })
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }
}

/// Context for variable substitution in hooks
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// Jail name
    pub jail_name: String,
    /// Kernel jail name (ioc-...)
    pub kernel_name: String,
    /// Jail filesystem path
    pub jail_path: String,
    /// Jail IP address (if assigned)
    pub jail_ip: Option<String>,
    /// Jail ID (if running)
    pub jid: Option<i32>,
    /// FIB jail commands run under
    pub fib: u32,
    /// User jail commands run as
    pub user: String,
    /// Additional custom variables
    pub extra: HashMap<String, String>,
}

impl HookContext {
    pub fn new(jail_name: &str, kernel_name: &str, jail_path: &Path) -> Self {
        Self {
            jail_name: jail_name.to_string(),
            kernel_name: kernel_name.to_string(),
            jail_path: jail_path.display().to_string(),
            user: "root".to_string(),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.jail_ip = ip;
        self
    }

    pub fn with_jid(mut self, jid: Option<i32>) -> Self {
        self.jid = jid;
        self
    }

    pub fn with_fib(mut self, fib: u32) -> Self {
        self.fib = fib;
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.extra.insert(name.to_string(), value.to_string());
        self
    }

    /// Substitute variables in a string
    ///
    /// Supported variables:
    /// - ${jail_name} - Jail name
    /// - ${jail_path} - Jail filesystem path
    /// - ${jail_ip} - Jail IP address
    /// - ${jid} - Jail ID
    /// - ${custom_var} - Custom variables from extra
    pub fn substitute(&self, input: &str) -> String {
        let mut result = input.to_string();

        result = result.replace("${jail_name}", &self.jail_name);
        result = result.replace("${jail_path}", &self.jail_path);
        result = result.replace("${jail_ip}", self.jail_ip.as_deref().unwrap_or(""));
        result = result.replace(
            "${jid}",
            &self.jid.map(|j| j.to_string()).unwrap_or_default(),
        );

        for (name, value) in &self.extra {
            result = result.replace(&format!("${{{}}}", name), value);
        }

        result
    }
}

/// Runner for executing hooks
pub struct HookRunner<'a> {
    ctx: &'a Context,
    hooks: Vec<Hook>,
    /// Output of jail-side hooks is appended here
    console_log: Option<PathBuf>,
}

impl<'a> HookRunner<'a> {
    pub fn new(ctx: &'a Context, hooks: Vec<Hook>) -> Self {
        Self {
            ctx,
            hooks,
            console_log: None,
        }
    }

    pub fn console_log(mut self, path: PathBuf) -> Self {
        self.console_log = Some(path);
        self
    }

    /// Execute all hooks for a given phase, in declaration order
    pub fn execute_phase(&self, phase: HookPhase, context: &HookContext) -> Result<()> {
        let phase_hooks: Vec<&Hook> = self.hooks.iter().filter(|h| h.phase == phase).collect();
        if phase_hooks.is_empty() {
            return Ok(());
        }

        tracing::debug!(jail = %context.jail_name, %phase, count = phase_hooks.len(), "running hooks");

        for hook in phase_hooks {
            if let Err(e) = self.execute_hook(hook, context) {
                let desc = hook.description.as_deref().unwrap_or(&hook.command);
                match hook.on_failure {
                    OnFailure::Abort => return Err(e),
                    OnFailure::Continue => {
                        tracing::warn!(jail = %context.jail_name, %phase, hook = desc, error = %e, "hook failed, continuing");
                    }
                }
            }
        }

        Ok(())
    }

    fn build_command(&self, hook: &Hook, context: &HookContext) -> Result<HostCommand> {
        let command = context.substitute(&hook.command);
        let args: Vec<String> = hook.args.iter().map(|a| context.substitute(a)).collect();

        let cmd = match hook.target {
            HookTarget::Host => HostCommand::new(command).args(args),
            HookTarget::Jail => {
                if context.jid.is_none() {
                    return Err(Error::NotRunning(context.jail_name.clone()));
                }
                let jexec = if context.fib > 0 {
                    HostCommand::new("setfib")
                        .arg(context.fib.to_string())
                        .arg("jexec")
                } else {
                    HostCommand::new("jexec")
                };
                jexec
                    .args(["-U", context.user.as_str(), context.kernel_name.as_str()])
                    .arg(command)
                    .args(args)
            }
        };
        Ok(cmd.timeout(Duration::from_secs(hook.timeout)))
    }

    fn execute_hook(&self, hook: &Hook, context: &HookContext) -> Result<()> {
        let cmd = self.build_command(hook, context)?;
        tracing::info!(jail = %context.jail_name, phase = %hook.phase, command = %cmd.line(), "hook");

        let output = self.ctx.host().run(&cmd)?;

        if hook.target == HookTarget::Jail
            && let Some(path) = &self.console_log
        {
            append_log(path, &output.combined())?;
        }

        if output.success() {
            Ok(())
        } else {
            Err(Error::ExternalProcess {
                command: cmd.line(),
                output: output.combined(),
            })
        }
    }
}

fn append_log(path: &Path, text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", text)?;
    Ok(())
}
