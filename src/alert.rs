//! Operator notification when a run stops on its own.

use log::debug;
use std::io::Write;

/// Best-effort audible or visual cue. Must never fail or block for long.
pub trait Alert: Send + Sync {
    fn notify(&self);
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Alert for TerminalBell {
    fn notify(&self) {
        let mut err = std::io::stderr();
        if let Err(e) = err.write_all(b"\x07").and_then(|_| err.flush()) {
            debug!("Could not ring terminal bell: {}", e);
        }
    }
}

/// Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Alert for Silent {
    fn notify(&self) {}
}

/// The alert a run should use.
pub fn alert_for(beep_on_stop: bool) -> Box<dyn Alert> {
    if beep_on_stop {
        Box::new(TerminalBell)
    } else {
        Box::new(Silent)
    }
}
