//! Binds a [`Protocol`] to a child process's stdio: the protocol rides
//! stdin/stdout, and stderr is forwarded separately as raw bytes, since it
//! carries whatever the child prints, not URP frames.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::gate::WriteFn;
use crate::protocol::{Protocol, ProtocolDelegate};

use super::TransportBackend;

const READ_BUF_SIZE: usize = 64 * 1024;

pub struct SubprocessTransport {
    protocol: Arc<Protocol>,
    child: Child,
    stdout_loop: JoinHandle<()>,
    stderr_loop: JoinHandle<()>,
}

impl SubprocessTransport {
    /// Spawn `command` with piped stdio and bind a protocol to stdin/stdout.
    /// `on_stderr` receives each chunk of the child's stderr as it arrives.
    pub fn spawn(
        mut command: Command,
        delegate: Arc<dyn ProtocolDelegate>,
        on_stderr: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let stdin = Arc::new(AsyncMutex::new(stdin));
        let write_fn: WriteFn = Box::new(move |bytes| {
            let stdin = stdin.clone();
            Box::pin(async move {
                let mut stdin = stdin.lock().await;
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            })
        });

        let protocol = Protocol::new(delegate, write_fn);
        let protocol_for_loop = protocol.clone();

        let stdout_loop = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        protocol_for_loop.connection_lost("child stdout reached EOF");
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = protocol_for_loop.recv_bytes(&buf[..n]) {
                            tracing::warn!(error = %e, "malformed input from child stdout");
                            protocol_for_loop.connection_lost(format!("malformed input: {e}"));
                            break;
                        }
                    }
                    Err(e) => {
                        protocol_for_loop.connection_lost(format!("child stdout read error: {e}"));
                        break;
                    }
                }
            }
        });

        let stderr_loop = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => on_stderr(buf[..n].to_vec()),
                }
            }
        });

        Ok(SubprocessTransport {
            protocol,
            child,
            stdout_loop,
            stderr_loop,
        })
    }

    /// The child's process id, if it's still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

impl TransportBackend for SubprocessTransport {
    fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    fn join(self) -> JoinHandle<()> {
        self.stderr_loop.abort();
        self.stdout_loop
    }
}
