use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, error, info};

use crate::error::ReplError;

use super::{Link, Recv};

/// A transport process running in a pseudo-terminal.
///
/// The bridge programs we talk through (BLE console bridges and the like)
/// expect a terminal on their stdio, so the process gets a PTY rather than
/// plain pipes. Output is pumped by a reader thread into a channel.
pub struct ProcessLink {
    // Dropping the master hangs up the child.
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output: Receiver<Vec<u8>>,
}

impl ProcessLink {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, ReplError> {
        debug!(program, ?args, "spawning transport");
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| {
                error!(error = %e, "failed to open pty");
                ReplError::Spawn(e.to_string())
            })?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(error = %e, program, "failed to spawn transport");
            ReplError::Spawn(format!("{program}: {e}"))
        })?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ReplError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ReplError::Spawn(e.to_string()))?;

        drop(pair.slave);

        let (output_tx, output_rx) = mpsc::channel();
        // Detached: it exits on its own once the child side of the pty is gone.
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    // EIO on the master means the child closed the slave side.
                    Err(_) => break,
                }
            }
        });

        info!(program, "transport started");
        Ok(Self {
            _master: pair.master,
            writer,
            child,
            output: output_rx,
        })
    }
}

impl Link for ProcessLink {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn recv(&mut self, wait: Duration) -> io::Result<Recv> {
        match self.output.recv_timeout(wait) {
            Ok(bytes) => Ok(Recv::Data(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(Recv::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Recv::Closed),
        }
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}
