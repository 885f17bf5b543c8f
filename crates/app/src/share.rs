//! Link sharing

use std::io::Write;
use std::process::{Command, Stdio};

use raidroom_net::RoomLink;
use tracing::{debug, warn};

/// Copy a room link to the clipboard. Returns false if every method failed.
pub fn copy_link(link: &RoomLink) -> bool {
    copy_to_clipboard(&link.to_url())
}

/// Copy text to clipboard with fallback for Wayland
pub fn copy_to_clipboard(text: &str) -> bool {
    // arboard covers X11, macOS, Windows and some Wayland compositors
    if let Ok(mut clipboard) = arboard::Clipboard::new() {
        if clipboard.set_text(text).is_ok() {
            debug!("Copied to clipboard via arboard");
            return true;
        }
    }

    if try_wl_copy(text) {
        debug!("Copied to clipboard via wl-copy");
        return true;
    }

    warn!("All clipboard methods failed");
    false
}

fn try_wl_copy(text: &str) -> bool {
    let mut child = match Command::new("wl-copy")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(_) => return false,
    };

    if let Some(mut stdin) = child.stdin.take() {
        if stdin.write_all(text.as_bytes()).is_err() {
            return false;
        }
    }

    matches!(child.wait(), Ok(status) if status.success())
}
