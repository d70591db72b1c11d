use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{debug, info};

use watch_repl::link::Recv;
use watch_repl::protocol::DETACH;
use watch_repl::session::Session;
use watch_repl::ReplError;

struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Pass keystrokes through to the interpreter until Ctrl-X or disconnect.
pub fn run(mut session: Session) -> Result<(), ReplError> {
    session.set_mirror(None);
    let mut stdout = io::stdout();
    stdout.write_all(session.drain_pending().as_bytes())?;
    stdout.flush()?;

    let _raw = RawMode::enable()?;
    info!("console attached, Ctrl-X to exit");

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        while let Ok(bytes) = rx.try_recv() {
            match session.send(&bytes) {
                Ok(()) => {}
                Err(ReplError::Closed { .. }) => {
                    info!("transport closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            if bytes.contains(&DETACH) {
                debug!("detach requested");
                return Ok(());
            }
        }
        match session.recv_raw(Duration::from_millis(20))? {
            Recv::Data(bytes) => {
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Recv::Idle => {}
            Recv::Closed => {
                info!("transport closed");
                return Ok(());
            }
        }
    }
}
