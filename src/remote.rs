use std::io::{self, Read};
use std::process::{Child, Command, Stdio};

use log::debug;
use thiserror::Error;

use crate::types::VmDescriptor;

const GCLOUD_BINARY: &str = "gcloud";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to start remote command on {host}")]
    Spawn {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Output of a remote command that ran to completion.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub(crate) success: bool,
    /// Lines written to stderr, in order. `nc` reports only there.
    pub(crate) lines: Vec<String>,
}

/// Handle to a remote command left running in the background.
pub trait RemoteProcess {
    /// Stop the process. Stopping an already exited process is not an error.
    fn terminate(&mut self) -> Result<(), TransportError>;

    /// If the process already exited unsuccessfully, what it wrote to stderr.
    /// `None` while it is still running or after a clean exit.
    fn exit_failure(&mut self) -> Result<Option<String>, TransportError>;
}

/// Capability to execute commands on a VM.
pub trait RemoteExec {
    fn spawn_detached(
        &self,
        vm: &VmDescriptor,
        command: &str,
    ) -> Result<Box<dyn RemoteProcess>, TransportError>;

    /// Run a command and wait for it, capturing its stderr.
    fn run_captured(&self, vm: &VmDescriptor, command: &str)
        -> Result<CapturedOutput, TransportError>;
}

/// Remote execution through `gcloud compute ssh`.
pub struct GcloudSsh {
    binary: String,
    ssh_flags: Vec<String>,
}

impl Default for GcloudSsh {
    fn default() -> Self {
        Self {
            binary: GCLOUD_BINARY.to_string(),
            ssh_flags: vec!["-o ConnectTimeout=10".to_string()],
        }
    }
}

impl GcloudSsh {
    fn ssh_command(&self, vm: &VmDescriptor, command: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "compute",
            "ssh",
            "--zone",
            vm.zone.as_str(),
            vm.name.as_str(),
            "--project",
            vm.project.as_str(),
        ]);
        cmd.args(self.ssh_flags.iter().map(|flag| format!("--ssh-flag={flag}")));
        cmd.args(["--command", command]);
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl RemoteExec for GcloudSsh {
    fn spawn_detached(
        &self,
        vm: &VmDescriptor,
        command: &str,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        debug!("Spawning on {}: {command}", vm.name);

        let mut cmd = self.ssh_command(vm, command);
        let child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TransportError::Spawn {
                host: vm.name.clone(),
                source,
            })?;

        Ok(Box::new(SshProcess { child }))
    }

    fn run_captured(
        &self,
        vm: &VmDescriptor,
        command: &str,
    ) -> Result<CapturedOutput, TransportError> {
        debug!("Running on {}: {command}", vm.name);

        let output = self
            .ssh_command(vm, command)
            .output()
            .map_err(|source| TransportError::Spawn {
                host: vm.name.clone(),
                source,
            })?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .for_each(|line| debug!("{} stdout: {line}", vm.name));

        let lines = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();

        Ok(CapturedOutput {
            success: output.status.success(),
            lines,
        })
    }
}

struct SshProcess {
    child: Child,
}

impl RemoteProcess for SshProcess {
    fn terminate(&mut self) -> Result<(), TransportError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        self.child.kill()?;
        self.child.wait()?;

        Ok(())
    }

    fn exit_failure(&mut self) -> Result<Option<String>, TransportError> {
        match self.child.try_wait()? {
            Some(status) if !status.success() => {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    pipe.read_to_string(&mut stderr)?;
                }
                Ok(Some(format!("{status}: {}", stderr.trim_end())))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use crate::probe::{ProbeConfig, Prober};
    use crate::remote::{GcloudSsh, RemoteExec, TransportError};
    use crate::types::{OutcomeKind, VmDescriptor};

    fn vm() -> VmDescriptor {
        VmDescriptor {
            name: "vm1".to_string(),
            project: "proj".to_string(),
            zone: "us-west1-b".to_string(),
            vpc: "vpc1".to_string(),
            subnet: "sub1".to_string(),
            internal_address: "10.0.0.2".to_string(),
            external_address: None,
        }
    }

    fn with_binary(binary: &str) -> GcloudSsh {
        GcloudSsh {
            binary: binary.to_string(),
            ssh_flags: vec![],
        }
    }

    #[test]
    fn ssh_command_arguments() {
        let ssh = GcloudSsh::default();
        let cmd = ssh.ssh_command(&vm(), "/usr/bin/nc -l -p 1234");

        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "gcloud");
        assert_eq!(
            args,
            vec![
                "compute",
                "ssh",
                "--zone",
                "us-west1-b",
                "vm1",
                "--project",
                "proj",
                "--ssh-flag=-o ConnectTimeout=10",
                "--command",
                "/usr/bin/nc -l -p 1234",
            ]
        );
    }

    #[test]
    fn run_captured_ignores_stdout() -> Result<(), TransportError> {
        let output = with_binary("echo").run_captured(&vm(), "hello")?;

        assert!(output.success);
        assert!(output.lines.is_empty());

        Ok(())
    }

    #[test]
    fn run_captured_collects_stderr_lines() -> Result<(), TransportError> {
        // `sh compute ...` fails to open the script "compute" and says so on stderr
        let output = with_binary("sh").run_captured(&vm(), "hello")?;

        assert!(!output.success);
        assert_eq!(output.lines.len(), 1);
        assert!(output.lines[0].contains("compute"));

        Ok(())
    }

    #[test]
    fn run_captured_fails_due_to_missing_binary() {
        let err = with_binary("/nonexistent/gcloud")
            .run_captured(&vm(), "true")
            .unwrap_err();

        assert!(matches!(err, TransportError::Spawn { ref host, .. } if host == "vm1"));
    }

    #[test]
    fn terminate_is_idempotent() -> Result<(), TransportError> {
        let mut process = with_binary("true").spawn_detached(&vm(), "ignored")?;

        process.terminate()?;
        process.terminate()?;

        Ok(())
    }

    #[test]
    fn exit_failure_reports_dead_session() -> Result<(), TransportError> {
        let mut process = with_binary("sh").spawn_detached(&vm(), "ignored")?;

        let mut failure = None;
        for _ in 0..100 {
            failure = process.exit_failure()?;
            if failure.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        assert!(failure.unwrap().contains("compute"));
        process.terminate()?;

        Ok(())
    }

    #[test]
    fn exit_failure_is_none_while_running() -> Result<(), TransportError> {
        // `yes` ignores the ssh arguments and runs until killed
        let mut process = with_binary("yes").spawn_detached(&vm(), "ignored")?;

        assert!(process.exit_failure()?.is_none());
        process.terminate()?;
        assert!(process.exit_failure()?.is_some());

        Ok(())
    }

    #[test]
    fn dead_listener_is_a_transport_failure() -> Result<(), anyhow::Error> {
        let dir = Path::new("_out_gcloud_stub");
        fs::create_dir_all(dir)?;
        let stub = dir.join("gcloud");
        fs::write(
            &stub,
            r#"#!/bin/sh
case "$*" in
  *"nc -l"*) echo "ERROR: (gcloud.compute.ssh) Could not fetch resource" >&2; exit 1 ;;
  *) echo "Ncat: Connection refused." >&2; exit 1 ;;
esac
"#,
        )?;
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755))?;

        let transport = with_binary(stub.to_str().unwrap_or_default());
        let prober = Prober::new(
            &transport,
            ProbeConfig {
                settle: Duration::from_millis(500),
                retry_interval: Duration::ZERO,
                ..Default::default()
            },
        );

        let mut server = vm();
        server.name = "vm2".to_string();
        let outcome = prober.probe_internal(&vm(), &server, 1234);

        assert_eq!(outcome.kind, OutcomeKind::Transport);
        assert!(outcome.detail.contains("Could not fetch resource"));

        // cleanup
        fs::remove_dir_all(dir)?;

        Ok(())
    }
}
