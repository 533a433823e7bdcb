//! Keeps the terminal from echoing `^C` over the progress bar.
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Clears `ECHOCTL` on stdout for as long as it lives, then restores the
/// previous terminal settings. Does nothing when stdout is not a terminal
/// or on non-Unix platforms.
pub struct EchoGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoGuard {
    #[cfg(unix)]
    pub fn new() -> Self {
        let out = stdout();
        if !out.is_terminal() {
            return Self { saved: None };
        }
        let fd = out.as_raw_fd();
        let saved = Termios::from_fd(fd).ok().filter(|original| {
            let mut quiet = *original;
            quiet.c_lflag &= !libc::ECHOCTL;
            tcsetattr(fd, TCSANOW, &quiet).is_ok()
        });
        Self { saved }
    }

    #[cfg(not(unix))]
    pub fn new() -> Self {
        Self {}
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = &self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}
