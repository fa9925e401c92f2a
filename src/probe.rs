use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::remote::{CapturedOutput, RemoteExec, RemoteProcess, TransportError};
use crate::types::{ConnectivityOutcome, OutcomeKind, VmDescriptor};

/// Client output patterns, checked in order against each line. Across lines
/// the last classified line decides the outcome.
const SIGNALS: &[(&str, OutcomeKind)] = &[
    ("Connected", OutcomeKind::Connected),
    ("succeeded!", OutcomeKind::Connected),
    ("refused", OutcomeKind::Refused),
    ("TIMEOUT", OutcomeKind::TimedOut),
    ("timed out", OutcomeKind::TimedOut),
];

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Internal,
    External,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Internal => write!(f, "internal"),
            AddressKind::External => write!(f, "external"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Wait after spawning the listener before the first connect attempt.
    pub(crate) settle: Duration,
    pub(crate) connect_timeout_secs: u64,
    /// Connect attempts while the listener refuses.
    pub(crate) attempts: u32,
    pub(crate) retry_interval: Duration,
    /// Upper bound on the listener's life on the remote host.
    pub(crate) listener_lifetime_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            connect_timeout_secs: 2,
            attempts: 3,
            retry_interval: Duration::from_secs(1),
            listener_lifetime_secs: 60,
        }
    }
}

pub struct Prober<'a> {
    transport: &'a dyn RemoteExec,
    config: ProbeConfig,
}

/// Terminates the listener when the probe returns, on every path.
struct ListenerGuard {
    host: String,
    process: Box<dyn RemoteProcess>,
}

impl ListenerGuard {
    fn failure(&mut self) -> Result<Option<ConnectivityOutcome>, TransportError> {
        let outcome = self.process.exit_failure()?.map(|stderr| {
            warn!("Listener on {} exited early: {stderr}", self.host);
            ConnectivityOutcome::new(
                OutcomeKind::Transport,
                format!("listener on {} exited: {stderr}", self.host),
            )
        });

        Ok(outcome)
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Err(err) = self.process.terminate() {
            warn!("Failed to stop listener on {}: {err:#}", self.host);
        }
    }
}

impl<'a> Prober<'a> {
    pub(crate) fn new(transport: &'a dyn RemoteExec, config: ProbeConfig) -> Self {
        Self { transport, config }
    }

    /// Connect from `from` to the internal address of `to`.
    pub(crate) fn probe_internal(
        &self,
        from: &VmDescriptor,
        to: &VmDescriptor,
        port: u16,
    ) -> ConnectivityOutcome {
        self.probe(from, to, port, AddressKind::Internal)
    }

    /// Connect from `from` to the external address of `to`.
    pub(crate) fn probe_external(
        &self,
        from: &VmDescriptor,
        to: &VmDescriptor,
        port: u16,
    ) -> ConnectivityOutcome {
        self.probe(from, to, port, AddressKind::External)
    }

    fn probe(
        &self,
        from: &VmDescriptor,
        to: &VmDescriptor,
        port: u16,
        kind: AddressKind,
    ) -> ConnectivityOutcome {
        let address = match kind {
            AddressKind::Internal => Some(to.internal_address.as_str()),
            AddressKind::External => to.external_address.as_deref(),
        };
        let Some(address) = address else {
            return ConnectivityOutcome::new(
                OutcomeKind::Unreachable,
                format!("{} has no {kind} address", to.name),
            );
        };

        info!(
            "Testing connection from {} to {} using {address} {port}",
            from.name, to.name
        );

        self.connect(from, to, address, port).unwrap_or_else(|err| {
            warn!("Remote execution failed: {err:#}");
            ConnectivityOutcome::new(OutcomeKind::Transport, format!("{err:#}"))
        })
    }

    fn connect(
        &self,
        from: &VmDescriptor,
        to: &VmDescriptor,
        address: &str,
        port: u16,
    ) -> Result<ConnectivityOutcome, TransportError> {
        let listener_cmd = format!(
            "timeout {} /usr/bin/nc -l -p {port}",
            self.config.listener_lifetime_secs
        );
        debug!("Command on server: {listener_cmd}");

        let mut listener = ListenerGuard {
            host: to.name.clone(),
            process: self.transport.spawn_detached(to, &listener_cmd)?,
        };

        thread::sleep(self.config.settle);

        if let Some(outcome) = listener.failure()? {
            return Ok(outcome);
        }

        let client_cmd = format!(
            "/usr/bin/nc -zv -w{} {address} {port}",
            self.config.connect_timeout_secs
        );
        debug!("Command on client: {client_cmd}");

        let mut attempt = 1;
        loop {
            let outcome = classify(&self.transport.run_captured(from, &client_cmd)?);

            // A refusal or timeout means nothing while the listener is gone.
            if outcome.kind != OutcomeKind::Connected {
                if let Some(dead) = listener.failure()? {
                    return Ok(dead);
                }
            }

            if outcome.kind != OutcomeKind::Refused || attempt >= self.config.attempts {
                return Ok(outcome);
            }

            debug!(
                "Connection refused (attempt {attempt}/{}), retrying",
                self.config.attempts
            );
            thread::sleep(self.config.retry_interval);
            attempt += 1;
        }
    }
}

fn classify(output: &CapturedOutput) -> ConnectivityOutcome {
    let mut verdict = None;
    let mut detail = String::new();

    for line in &output.lines {
        debug!("client: {}", line.trim_end());

        let Some(&(_, kind)) = SIGNALS.iter().find(|(pattern, _)| line.contains(*pattern)) else {
            continue;
        };

        if kind != OutcomeKind::Connected {
            detail.push_str(line.trim_end());
            detail.push('\n');
        }
        verdict = Some(kind);
    }

    match verdict {
        Some(kind) => ConnectivityOutcome::new(kind, detail),
        None => ConnectivityOutcome::new(
            OutcomeKind::Transport,
            format!(
                "client produced no connection verdict (exit {}): {}",
                if output.success { "ok" } else { "failed" },
                output.lines.join(" | ")
            ),
        ),
    }
}
