//! Channel transports — how a worker is reached.
//!
//! Every channel runs over its own link: an in-process agent behind an
//! in-memory pipe for the local backend, or a child process (normally
//! `ssh host profitd serve`) whose stdin/stdout carry the frames.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use profit_core::config::AgentConfig;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// In-memory pipe buffer for local links.
const PIPE_CAPACITY: usize = 256 * 1024;

/// An open byte link to one worker agent.
pub struct Link {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    /// Worker process, when the link is a child's stdio.
    pub child: Option<Child>,
}

/// Where channels are opened.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Agent served in-process over an in-memory pipe.
    Local(AgentConfig),
    /// Worker launched as a child process speaking the protocol on stdio.
    Process(ProcessSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// An SSH-reachable worker host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Worker binary on the remote host.
    pub remote_command: String,
}

impl SshTarget {
    /// `ssh [-p port] [-i identity] -o BatchMode=yes [user@]host <command> serve`.
    pub fn process(&self) -> ProcessSpec {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
        args.push(match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        });
        args.push(self.remote_command.clone());
        args.push("serve".to_string());
        ProcessSpec {
            program: "ssh".to_string(),
            args,
        }
    }
}

impl Endpoint {
    pub fn local(agent: AgentConfig) -> Self {
        Self::Local(agent)
    }

    pub fn ssh(target: &SshTarget) -> Self {
        Self::Process(target.process())
    }

    /// Open a fresh link. Local links spawn their agent on the current runtime.
    pub fn open(&self) -> io::Result<Link> {
        match self {
            Self::Local(agent) => {
                let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
                let (server_rx, server_tx) = tokio::io::split(server);
                let agent = agent.clone();
                tokio::spawn(async move {
                    if let Err(e) = crate::agent::serve(server_rx, server_tx, agent).await {
                        tracing::warn!(error = %e, "local agent exited with error");
                    }
                });
                let (rx, tx) = tokio::io::split(client);
                Ok(Link {
                    reader: Box::new(rx),
                    writer: Box::new(tx),
                    child: None,
                })
            }
            Self::Process(spec) => {
                let mut child = Command::new(&spec.program)
                    .args(&spec.args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
                tracing::debug!(program = %spec.program, args = ?spec.args, pid = child.id(), "worker process launched");
                Ok(Link {
                    reader: Box::new(stdout),
                    writer: Box::new(stdin),
                    child: Some(child),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_command_line_includes_optional_parts() {
        let target = SshTarget {
            host: "hpc".into(),
            user: Some("fit".into()),
            port: Some(2222),
            identity_file: Some(PathBuf::from("/keys/id")),
            remote_command: "/opt/profit/bin/profitd".into(),
        };
        let spec = target.process();
        assert_eq!(spec.program, "ssh");
        assert_eq!(
            spec.args,
            [
                "-p", "2222", "-i", "/keys/id", "-o", "BatchMode=yes", "fit@hpc",
                "/opt/profit/bin/profitd", "serve"
            ]
        );
    }

    #[test]
    fn ssh_command_line_minimal() {
        let target = SshTarget {
            host: "box".into(),
            user: None,
            port: None,
            identity_file: None,
            remote_command: "profitd".into(),
        };
        assert_eq!(
            target.process().args,
            ["-o", "BatchMode=yes", "box", "profitd", "serve"]
        );
    }
}
