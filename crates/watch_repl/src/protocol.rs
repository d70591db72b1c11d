//! Control bytes and prompt literals of the remote interpreter.

/// Ctrl-C: abort whatever is running and return to the command prompt.
pub const INTERRUPT: u8 = 0x03;
/// Ctrl-D: end of paste input; compile and run what was pasted.
pub const END_OF_INPUT: u8 = 0x04;
/// Ctrl-E: enter paste mode.
pub const ENTER_PASTE: u8 = 0x05;
/// Ctrl-X: detach the console without stopping the resumed foreground task.
pub const DETACH: u8 = 0x18;

pub const COMMAND_PROMPT: &str = ">>> ";
pub const PASTE_PROMPT: &str = "=== ";
/// The paste prompt as re-printed after each accepted line. It always starts
/// a fresh line, so a pasted line that contains `=== ` cannot be mistaken
/// for it.
pub const PASTE_LINE_PROMPT: &str = "\r\n=== ";
pub const RUNNING_BANNER: &str = "Watch is running, use Ctrl-C to stop";

/// Printed by the transport bridge once the link is up.
pub const CONNECT_BANNER: &str = "Connect";
pub const CONSOLE_BANNER: &str = "Exit console using Ctrl-X";

/// Restarts the foreground task after we are done with the prompt.
pub const RESUME_COMMAND: &str = "wasp.system.run()";

pub const LINE_END: &str = "\r";
