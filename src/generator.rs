//! The external process that turns a captured traffic file into live requests
//! against the embedded listener.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::JobConfig;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read generator output: {0}")]
    Output(#[source] io::Error),
}

/// Replays one traffic file against the listener and returns once the file has
/// been sent.
#[async_trait]
pub trait TrafficGenerator: Send + Sync {
    async fn replay(&self, file: &Path) -> Result<(), GeneratorError>;
}

/// Runs the `gor` binary.
#[derive(Debug, Clone)]
pub struct GorGenerator {
    pub program: String,
    pub output: SocketAddr,
    pub speed: u64,
    pub methods: Vec<String>,
    pub allow_url_regex: Vec<String>,
    pub disallow_url_regex: Vec<String>,
}

impl GorGenerator {
    pub fn from_config(config: &JobConfig, output: SocketAddr) -> Self {
        Self {
            program: config.generator.clone(),
            output,
            speed: config.speed,
            methods: config.methods.clone(),
            allow_url_regex: config.allow_url_regex.clone(),
            disallow_url_regex: config.disallow_url_regex.clone(),
        }
    }

    /// Command-line arguments for replaying `file`.
    pub fn args(&self, file: &Path) -> Vec<String> {
        let mut args = vec![
            "--verbose".to_string(),
            "--debug".to_string(),
            "--input-file".to_string(),
            format!("{}|{}%", file.display(), self.speed),
            "--output-http".to_string(),
            self.output.to_string(),
        ];
        for method in &self.methods {
            args.push("--http-allow-method".to_string());
            args.push(method.clone());
        }
        for regex in &self.allow_url_regex {
            args.push("--http-allow-url".to_string());
            args.push(regex.clone());
        }
        for regex in &self.disallow_url_regex {
            args.push("--http-disallow-url".to_string());
            args.push(regex.clone());
        }
        args
    }
}

#[async_trait]
impl TrafficGenerator for GorGenerator {
    /// gor keeps running after the input file is exhausted; the first output
    /// on its stderr marks the end of the file.
    async fn replay(&self, file: &Path) -> Result<(), GeneratorError> {
        let args = self.args(file);
        debug!(program = %self.program, args = ?args, "Starting traffic generator");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GeneratorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let read = match child.stderr.take() {
            Some(mut stderr) => {
                let mut buf = [0u8; 1000];
                stderr.read(&mut buf).await.map(|n| {
                    debug!(output = %String::from_utf8_lossy(&buf[..n]), "Traffic generator finished");
                })
            }
            None => Ok(()),
        };

        if let Err(e) = child.kill().await {
            debug!(error = %e, "Traffic generator already exited");
        }
        read.map_err(GeneratorError::Output)
    }
}
