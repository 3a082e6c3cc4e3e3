//! Filesystem control toggles shared by all daemons.
//!
//! Coordination between daemons happens through the relational store plus a
//! handful of flag files: a kill switch (presence = exit next cycle), a pause
//! toggle, the backfill enable/pause/stop set, and the debug-mode file.

use std::path::{Path, PathBuf};

pub const KILL_SWITCH_FILE: &str = "KILL_SWITCH";
pub const PAUSE_FILE: &str = "PAUSE";
pub const BACKFILL_ENABLE_FILE: &str = "BACKFILL_ENABLED";
pub const BACKFILL_PAUSE_FILE: &str = "BACKFILL_PAUSE";
pub const BACKFILL_STOP_FILE: &str = "BACKFILL_STOP";
pub const DEBUG_MODE_FILE: &str = ".debug_mode";

#[derive(Debug, Clone)]
pub struct ControlFlags {
    dir: PathBuf,
}

impl ControlFlags {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let _ = std::fs::create_dir_all(&dir);
        ControlFlags { dir }
    }

    fn flag(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn kill_switch_active(&self) -> bool {
        self.flag(KILL_SWITCH_FILE).exists()
    }

    pub fn paused(&self) -> bool {
        self.flag(PAUSE_FILE).exists()
    }

    pub fn backfill_enabled(&self) -> bool {
        self.flag(BACKFILL_ENABLE_FILE).exists()
    }

    pub fn backfill_paused(&self) -> bool {
        self.flag(BACKFILL_PAUSE_FILE).exists()
    }

    pub fn backfill_stop_requested(&self) -> bool {
        self.flag(BACKFILL_STOP_FILE).exists()
    }

    pub fn set_backfill_enabled(&self, on: bool) -> std::io::Result<()> {
        self.set(BACKFILL_ENABLE_FILE, on)
    }

    pub fn set_backfill_paused(&self, on: bool) -> std::io::Result<()> {
        self.set(BACKFILL_PAUSE_FILE, on)
    }

    pub fn set_backfill_stop(&self, on: bool) -> std::io::Result<()> {
        self.set(BACKFILL_STOP_FILE, on)
    }

    fn set(&self, name: &str, on: bool) -> std::io::Result<()> {
        let path = self.flag(name);
        if on {
            std::fs::write(path, "")
        } else {
            match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        }
    }

    pub fn debug_mode_on(&self) -> bool {
        std::fs::read_to_string(self.flag(DEBUG_MODE_FILE))
            .map(|s| s.trim().eq_ignore_ascii_case("on"))
            .unwrap_or(false)
    }

    pub fn set_debug_mode(&self, on: bool) -> std::io::Result<()> {
        std::fs::write(self.flag(DEBUG_MODE_FILE), if on { "on" } else { "off" })
    }

    /// Write-or-reject pidfile for exclusive batch jobs. Returns false when a
    /// live pid already holds the file.
    pub fn acquire_pidfile(&self, name: &str) -> std::io::Result<bool> {
        let path = self.flag(name);
        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if Path::new(&format!("/proc/{pid}")).exists() {
                    return Ok(false);
                }
            }
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(true)
    }

    pub fn release_pidfile(&self, name: &str) {
        let _ = std::fs::remove_file(self.flag(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_flags() -> ControlFlags {
        let dir = std::env::temp_dir().join(format!(
            "perp-core-ctl-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        ControlFlags::new(dir)
    }

    #[test]
    fn test_kill_switch_presence() {
        let flags = temp_flags();
        assert!(!flags.kill_switch_active());
        std::fs::write(flags.flag(KILL_SWITCH_FILE), "").unwrap();
        assert!(flags.kill_switch_active());
    }

    #[test]
    fn test_backfill_toggles() {
        let flags = temp_flags();
        assert!(!flags.backfill_enabled());
        flags.set_backfill_enabled(true).unwrap();
        assert!(flags.backfill_enabled());
        flags.set_backfill_enabled(false).unwrap();
        assert!(!flags.backfill_enabled());
        // idempotent removal
        flags.set_backfill_enabled(false).unwrap();
    }

    #[test]
    fn test_debug_mode_roundtrip() {
        let flags = temp_flags();
        assert!(!flags.debug_mode_on());
        flags.set_debug_mode(true).unwrap();
        assert!(flags.debug_mode_on());
        flags.set_debug_mode(false).unwrap();
        assert!(!flags.debug_mode_on());
    }
}
