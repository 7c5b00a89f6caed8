//! Reboot requests.

use std::io;
use std::process::{Command, Stdio};
use tracing::info;

/// Something that can ask the device to reboot. The request must return as
/// soon as the reboot is scheduled; it never waits for the reboot itself.
pub trait Rebooter: Send + Sync {
    fn request_reboot(&self) -> io::Result<()>;
}

/// Spawns the configured command (e.g. `reboot -d 3`) and detaches from it.
pub struct CommandRebooter {
    command: Vec<String>,
}

impl CommandRebooter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Rebooter for CommandRebooter {
    fn request_reboot(&self) -> io::Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty reboot command"))?;

        info!("Requesting reboot: {}", self.command.join(" "));
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}
