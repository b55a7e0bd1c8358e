//! Host command execution
//!
//! Every interaction with the host OS (zfs, ifconfig, jail, devfs, rctl...)
//! goes through the [`Host`] trait so components can be driven by a
//! recording stub in tests.

use crate::error::{Error, Result};
use crate::jail::ffi::{self, JailFlags};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// An external command to run on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run a shell command line inside a jail, optionally under a FIB
    pub fn jexec(jail_name: &str, fib: u32, command_line: &str) -> Self {
        let cmd = if fib > 0 {
            HostCommand::new("setfib")
                .arg(fib.to_string())
                .arg("jexec")
        } else {
            HostCommand::new("jexec")
        };
        cmd.arg(jail_name).args(["/bin/sh", "-c", command_line])
    }

    /// Run an argv inside a jail without a shell
    pub fn jexec_argv<I, S>(jail_name: &str, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HostCommand::new("jexec").arg(jail_name).args(argv)
    }

    /// The command line as it would be typed
    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (None when killed by a signal)
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Combined output (stdout + stderr)
    pub fn combined(&self) -> String {
        let out = self.stdout.trim_end();
        let err = self.stderr.trim_end();
        if out.is_empty() {
            err.to_string()
        } else if err.is_empty() {
            out.to_string()
        } else {
            format!("{}\n{}", out, err)
        }
    }
}

/// Access to the host operating system
pub trait Host: Send + Sync {
    /// Run a command and capture its output
    ///
    /// Only spawn failures and timeouts are errors; a non-zero exit is
    /// reported through [`CommandOutput::status`].
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput>;

    /// JID of a running jail by kernel name
    fn jail_id(&self, name: &str) -> Option<i32>;

    /// Whether a removed jail is still being torn down by the kernel
    fn jail_dying(&self, _name: &str) -> bool {
        false
    }

    /// Run a command and fail with its captured output on non-zero exit
    fn check(&self, cmd: &HostCommand) -> Result<String> {
        let output = self.run(cmd)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::ExternalProcess {
                command: cmd.line(),
                output: output.combined(),
            })
        }
    }
}

/// The real host: spawns processes and queries the kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHost;

impl ProcessHost {
    fn spawn_and_wait(cmd: &HostCommand) -> Result<CommandOutput> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalProcess {
                command: cmd.line(),
                output: e.to_string(),
            })?;

        if let (Some(input), Some(mut pipe)) = (&cmd.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }

        // Drain pipes on their own threads so a chatty child can't block
        let stdout = child.stdout.take().map(|mut h| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = h.read_to_string(&mut buf);
                buf
            })
        });
        let stderr = child.stderr.take().map(|mut h| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = h.read_to_string(&mut buf);
                buf
            })
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if let Some(timeout) = cmd.timeout
                        && start.elapsed() > timeout
                    {
                        let _ = child.kill();
                        // Reap after kill
                        let _ = child.wait();
                        return Err(Error::Timeout {
                            command: cmd.line(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };

        Ok(CommandOutput {
            status: status.code(),
            stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
            stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
        })
    }
}

impl Host for ProcessHost {
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        tracing::trace!(command = %cmd.line(), "exec");
        Self::spawn_and_wait(cmd)
    }

    fn jail_id(&self, name: &str) -> Option<i32> {
        ffi::jail_getid(name).ok()
    }

    fn jail_dying(&self, name: &str) -> bool {
        ffi::jail_getid(name).is_err() && ffi::jail_getid_with(name, JailFlags::DYING).is_ok()
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording host stub

    use super::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        calls: Vec<String>,
        rules: Vec<(String, CommandOutput)>,
        running: HashMap<String, i32>,
        next_jid: i32,
        datasets: BTreeSet<String>,
        zfs_props: BTreeMap<(String, String), String>,
    }

    /// Host stub that records every command line and answers from rules
    ///
    /// Rules match on command-line prefix, most recently added first.
    /// Unmatched `zfs` commands are answered from a small in-memory pool
    /// model; other unmatched commands succeed with empty output. `jail -c`
    /// and `jail -r` update the set of running jails.
    #[derive(Default)]
    pub struct FakeHost {
        state: Mutex<State>,
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, prefix: &str, output: CommandOutput) {
            self.state
                .lock()
                .unwrap()
                .rules
                .push((prefix.to_string(), output));
        }

        pub fn set_running(&self, name: &str, jid: i32) {
            self.state
                .lock()
                .unwrap()
                .running
                .insert(name.to_string(), jid);
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(prefix))
                .collect()
        }

        pub fn called(&self, prefix: &str) -> bool {
            !self.calls_matching(prefix).is_empty()
        }

        /// Position of the first call with this prefix
        pub fn position(&self, prefix: &str) -> Option<usize> {
            self.calls().iter().position(|c| c.starts_with(prefix))
        }

        pub fn is_running(&self, name: &str) -> bool {
            self.state.lock().unwrap().running.contains_key(name)
        }

        /// Seed datasets (or `ds@snap` snapshots) into the pool model
        pub fn add_datasets(&self, names: &[&str]) {
            let mut state = self.state.lock().unwrap();
            for name in names {
                state.datasets.insert(name.to_string());
            }
        }

        /// Datasets and snapshots at or below `root`
        pub fn datasets_under(&self, root: &str) -> Vec<String> {
            let state = self.state.lock().unwrap();
            state
                .datasets
                .iter()
                .filter(|d| is_under(d, root))
                .cloned()
                .collect()
        }

        pub fn zfs_prop(&self, dataset: &str, prop: &str) -> Option<String> {
            self.state
                .lock()
                .unwrap()
                .zfs_props
                .get(&(dataset.to_string(), prop.to_string()))
                .cloned()
        }
    }

    fn is_under(name: &str, root: &str) -> bool {
        name == root
            || name
                .strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('@'))
    }

    fn missing(name: &str) -> CommandOutput {
        CommandOutput::failed(1, format!("cannot open '{}': dataset does not exist", name))
    }

    /// Positional arguments, skipping flags and their values
    fn positionals<'a>(args: &'a [String], with_value: &[&str]) -> Vec<&'a str> {
        let mut out = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if with_value.contains(&arg.as_str()) {
                iter.next();
            } else if !arg.starts_with('-') {
                out.push(arg.as_str());
            }
        }
        out
    }

    fn zfs_model(state: &mut State, args: &[String]) -> CommandOutput {
        let Some((verb, rest)) = args.split_first() else {
            return CommandOutput::failed(2, "missing command");
        };
        let flags: Vec<&str> = rest.iter().map(String::as_str).filter(|a| a.starts_with('-')).collect();
        let recursive = flags.iter().any(|f| f.contains('r') || f.contains('R'));

        match verb.as_str() {
            "create" => {
                let pos = positionals(rest, &["-o"]);
                let Some(name) = pos.last() else {
                    return CommandOutput::failed(2, "missing dataset");
                };
                if state.datasets.contains(*name) {
                    return CommandOutput::failed(1, format!("cannot create '{}': dataset already exists", name));
                }
                state.datasets.insert(name.to_string());
                CommandOutput::ok("")
            }
            "snapshot" => {
                let pos = positionals(rest, &["-o"]);
                let Some(name) = pos.last() else {
                    return CommandOutput::failed(2, "missing snapshot");
                };
                if state.datasets.contains(*name) {
                    return CommandOutput::failed(1, format!("cannot create snapshot '{}': dataset already exists", name));
                }
                state.datasets.insert(name.to_string());
                CommandOutput::ok("")
            }
            "clone" => {
                let pos = positionals(rest, &["-o"]);
                let [snap, target] = pos.as_slice() else {
                    return CommandOutput::failed(2, "usage: clone snap target");
                };
                if !state.datasets.contains(*snap) {
                    return missing(snap);
                }
                if state.datasets.contains(*target) {
                    return CommandOutput::failed(1, format!("cannot create '{}': dataset already exists", target));
                }
                state.datasets.insert(target.to_string());
                CommandOutput::ok("")
            }
            "destroy" => {
                let pos = positionals(rest, &[]);
                let Some(name) = pos.last() else {
                    return CommandOutput::failed(2, "missing dataset");
                };
                if !state.datasets.contains(*name) {
                    return missing(name);
                }
                if recursive {
                    state.datasets.retain(|d| !is_under(d, name));
                } else {
                    state.datasets.remove(*name);
                }
                CommandOutput::ok("")
            }
            "rename" => {
                let pos = positionals(rest, &[]);
                let [from, to] = pos.as_slice() else {
                    return CommandOutput::failed(2, "usage: rename from to");
                };
                if !state.datasets.contains(*from) {
                    return missing(from);
                }
                let moved: Vec<String> = state
                    .datasets
                    .iter()
                    .filter(|d| is_under(d, from))
                    .cloned()
                    .collect();
                for old in moved {
                    let new = format!("{}{}", to, &old[from.len()..]);
                    state.datasets.remove(&old);
                    state.datasets.insert(new.clone());
                    // Properties follow the dataset; an origin names the renamed snapshot
                    let props = std::mem::take(&mut state.zfs_props);
                    for ((dataset, prop), value) in props {
                        let dataset = if dataset == old { new.clone() } else { dataset };
                        let value = if value == old { new.clone() } else { value };
                        state.zfs_props.insert((dataset, prop), value);
                    }
                }
                CommandOutput::ok("")
            }
            "list" => {
                let pos = positionals(rest, &["-o", "-t", "-d", "-s", "-S"]);
                let snapshots = rest
                    .windows(2)
                    .any(|w| w[0] == "-t" && w[1].contains("snapshot"));
                let columns = rest
                    .windows(2)
                    .find(|w| w[0] == "-o")
                    .map(|w| w[1].split(',').count())
                    .unwrap_or(1);
                let root = pos.last().copied();
                if let Some(root) = root
                    && !state.datasets.contains(root)
                {
                    return missing(root);
                }
                let rows: Vec<String> = state
                    .datasets
                    .iter()
                    .filter(|d| d.contains('@') == snapshots)
                    .filter(|d| match root {
                        Some(root) if recursive || snapshots => is_under(d, root),
                        Some(root) => d.as_str() == root,
                        None => true,
                    })
                    .map(|d| {
                        let mut row = d.clone();
                        for _ in 1..columns {
                            row.push_str("\t0");
                        }
                        row
                    })
                    .collect();
                let mut out = rows.join("\n");
                if !out.is_empty() {
                    out.push('\n');
                }
                CommandOutput::ok(out)
            }
            "get" => {
                let pos = positionals(rest, &["-o", "-t", "-s"]);
                let [prop, name] = pos.as_slice() else {
                    return CommandOutput::failed(2, "usage: get prop dataset");
                };
                if !state.datasets.contains(*name) {
                    return missing(name);
                }
                let value = state
                    .zfs_props
                    .get(&(name.to_string(), prop.to_string()))
                    .cloned()
                    .unwrap_or_else(|| "-".to_string());
                CommandOutput::ok(format!("{}\n", value))
            }
            "set" => {
                let pos = positionals(rest, &[]);
                let [assignment, name] = pos.as_slice() else {
                    return CommandOutput::failed(2, "usage: set prop=value dataset");
                };
                if !state.datasets.contains(*name) {
                    return missing(name);
                }
                let Some((prop, value)) = assignment.split_once('=') else {
                    return CommandOutput::failed(2, "bad property assignment");
                };
                state
                    .zfs_props
                    .insert((name.to_string(), prop.to_string()), value.to_string());
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        }
    }

    impl Host for FakeHost {
        fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
            let line = cmd.line();
            let mut state = self.state.lock().unwrap();
            state.calls.push(line.clone());

            let scripted = state
                .rules
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone());

            let output = match scripted {
                Some(output) => output,
                None if cmd.program == "zfs" => zfs_model(&mut state, &cmd.args),
                None => CommandOutput::ok(""),
            };

            if output.success() && cmd.program == "jail" {
                if cmd.args.first().map(String::as_str) == Some("-c") {
                    let name = cmd
                        .args
                        .iter()
                        .find_map(|a| a.strip_prefix("name="))
                        .map(str::to_string);
                    if let Some(name) = name {
                        state.next_jid += 1;
                        let jid = state.next_jid;
                        state.running.insert(name, jid);
                    }
                } else if cmd.args.first().map(String::as_str) == Some("-r")
                    && let Some(name) = cmd.args.get(1)
                {
                    state.running.remove(name);
                }
            }

            Ok(output)
        }

        fn jail_id(&self, name: &str) -> Option<i32> {
            self.state.lock().unwrap().running.get(name).copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::*;

    #[test]
    fn test_jexec_with_fib() {
        let cmd = HostCommand::jexec("ioc-web", 2, "service nginx start");
        assert_eq!(
            cmd.line(),
            "setfib 2 jexec ioc-web /bin/sh -c service nginx start"
        );

        let cmd = HostCommand::jexec("ioc-web", 0, "true");
        assert_eq!(cmd.program, "jexec");
    }

    #[test]
    fn test_check_reports_output() {
        let host = FakeHost::new();
        host.respond(
            "zfs destroy",
            CommandOutput::failed(1, "cannot destroy: dataset is busy"),
        );

        let err = host
            .check(&HostCommand::new("zfs").args(["destroy", "tank/x"]))
            .unwrap_err();
        match err {
            Error::ExternalProcess { command, output } => {
                assert_eq!(command, "zfs destroy tank/x");
                assert!(output.contains("busy"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fake_tracks_jails() {
        let host = FakeHost::new();
        host.check(&HostCommand::new("jail").args(["-c", "name=ioc-a", "persist"]))
            .unwrap();
        assert!(host.jail_id("ioc-a").is_some());

        host.check(&HostCommand::new("jail").args(["-r", "ioc-a"]))
            .unwrap();
        assert!(host.jail_id("ioc-a").is_none());
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            status: Some(1),
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(!out.success());
    }

    #[test]
    fn test_fake_zfs_model() {
        let host = FakeHost::new();
        let zfs = |args: &[&str]| host.run(&HostCommand::new("zfs").args(args.iter().copied())).unwrap();

        assert!(!zfs(&["list", "-H", "-o", "name", "tank/a"]).success());
        assert!(zfs(&["create", "-p", "-o", "compression=lz4", "tank/a"]).success());
        assert!(zfs(&["snapshot", "tank/a@s1"]).success());
        assert!(zfs(&["clone", "tank/a@s1", "tank/b"]).success());
        assert!(!zfs(&["clone", "tank/a@s1", "tank/b"]).success());

        let out = zfs(&["list", "-H", "-t", "snapshot", "-o", "name,creation,used", "tank/a"]);
        assert_eq!(out.stdout, "tank/a@s1\t0\t0\n");

        assert!(zfs(&["destroy", "-r", "tank/a"]).success());
        assert_eq!(host.datasets_under("tank"), vec!["tank/b"]);
    }
}
