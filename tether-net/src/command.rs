//! Utilities for running the helper programs (`ip`, `iptables`, `dnsmasq`).

use std::{
    ffi::OsStr,
    io,
    process::{self, Child},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("{program} exited with {}: {}", .output.status, .output.stderr.trim())]
    NonZero { program: String, output: Output },
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Runner;

impl Runner {
    /// Runs `program` with `args` to completion. A non-zero exit status is an error.
    pub fn run<I, S>(program: &str, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = process::Command::new(program);
        cmd.args(args).stderr(process::Stdio::piped()).stdout(process::Stdio::piped());

        tracing::debug!(?cmd, "running command");

        let output: Output = cmd.spawn()?.wait_with_output()?.into();

        if !output.status.success() {
            tracing::debug!(?output.stderr, ?output.status, ?cmd, "command returned non-zero status");
            return Err(Error::NonZero { program: program.to_string(), output });
        }

        Ok(output)
    }

    /// Starts `program` as a long-running child. The caller owns its lifetime.
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = process::Command::new(program);
        cmd.args(args).stdin(process::Stdio::null()).stdout(process::Stdio::null());

        tracing::debug!(?cmd, "spawning command");

        Ok(cmd.spawn()?)
    }
}
