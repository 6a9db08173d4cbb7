//! Directory tracking: inference from commands and authoritative snapshots.

use shellblocks_core::cwd::DirectoryTracker;
use shellblocks_core::error::Result;
use shellblocks_core::session::SessionBoundary;

fn tracker(cwd: &str) -> DirectoryTracker {
    DirectoryTracker::new(cwd, "/home/user")
}

// ════════════════════════════════════════════════════════════════
// cd inference
// ════════════════════════════════════════════════════════════════

#[test]
fn test_cd_dotdot_goes_up_one() {
    let mut t = tracker("/a/b");
    assert_eq!(t.on_command("cd .."), Some("/a".to_string()));
    assert_eq!(t.current(), "/a");
}

#[test]
fn test_bare_cd_goes_home() {
    let mut t = tracker("/a/b");
    t.on_command("cd");
    assert_eq!(t.current(), "/home/user");
}

#[test]
fn test_absolute_cd_replaces_path() {
    let mut t = tracker("/var/log/nginx");
    t.on_command("cd /tmp");
    assert_eq!(t.current(), "/tmp");
}

#[test]
fn test_tilde_resolves_to_home() {
    let mut t = tracker("/etc");
    t.on_command("cd ~");
    assert_eq!(t.current(), "/home/user");
    t.on_command("cd ~/projects/app");
    assert_eq!(t.current(), "/home/user/projects/app");
}

#[test]
fn test_relative_segments_resolve_against_current() {
    let mut t = tracker("/srv");
    t.on_command("cd ./www/../data//raw/");
    assert_eq!(t.current(), "/srv/data/raw");
}

#[test]
fn test_dotdot_at_root_stays_at_root() {
    let mut t = tracker("/");
    t.on_command("cd ../..");
    assert_eq!(t.current(), "/");
}

#[test]
fn test_quoted_argument_is_unquoted() {
    let mut t = tracker("/home/user");
    t.on_command("cd \"My Documents\"");
    assert_eq!(t.current(), "/home/user/My Documents");
}

#[test]
fn test_dash_returns_to_previous() {
    let mut t = tracker("/a");
    t.on_command("cd /b");
    t.on_command("cd -");
    assert_eq!(t.current(), "/a");
}

#[test]
fn test_pushd_and_chdir_are_directory_changes() {
    let mut t = tracker("/a");
    t.on_command("pushd /opt");
    assert_eq!(t.current(), "/opt");
    t.on_command("chdir bin");
    assert_eq!(t.current(), "/opt/bin");
}

#[test]
fn test_compound_commands_apply_in_order() {
    let mut t = tracker("/");
    t.on_command("cd /usr && cd local; cd share");
    assert_eq!(t.current(), "/usr/local/share");
}

#[test]
fn test_or_branch_is_not_followed() {
    let mut t = tracker("/a");
    t.on_command("test -d x || cd /elsewhere");
    assert_eq!(t.current(), "/a");
}

#[test]
fn test_non_cd_commands_change_nothing() {
    let mut t = tracker("/home/user");
    assert_eq!(t.on_command("ls -la"), None);
    assert_eq!(t.on_command("cdrecord disk.iso"), None);
    assert_eq!(t.on_command(""), None);
    assert_eq!(t.current(), "/home/user");
}

#[test]
fn test_windows_drive_paths_normalize() {
    let mut t = DirectoryTracker::new("C:\\Users\\me", "C:\\Users\\me");
    t.on_command("cd ..\\Public");
    assert_eq!(t.current(), "C:\\Users\\Public");
    t.on_command("cd D:\\work");
    assert_eq!(t.current(), "D:\\work");
}

// ════════════════════════════════════════════════════════════════
// Snapshots
// ════════════════════════════════════════════════════════════════

#[test]
fn test_snapshot_overrides_inference() {
    let mut t = tracker("/a");
    t.on_command("cd b");
    t.apply_snapshot("/really/here");
    assert_eq!(t.current(), "/really/here");
}

#[test]
fn test_blank_snapshot_is_ignored() {
    let mut t = tracker("/a");
    t.apply_snapshot("   ");
    assert_eq!(t.current(), "/a");
}

#[test]
fn test_empty_initial_directory_starts_at_home() {
    let t = DirectoryTracker::new("", "/home/user");
    assert_eq!(t.current(), "/home/user");
}

// ════════════════════════════════════════════════════════════════
// Validation is advisory
// ════════════════════════════════════════════════════════════════

struct FakeSession;

impl SessionBoundary for FakeSession {
    fn write(&self, _text: &str) -> Result<()> {
        Ok(())
    }
    fn signal(&self, _process_id: u32, _signal: i32) -> Result<()> {
        Ok(())
    }
    fn process_id(&self) -> Option<u32> {
        None
    }
    fn directory_exists(&self, path: &str) -> bool {
        path == "/exists"
    }
}

#[test]
fn test_validation_delegates_to_session_and_does_not_block_tracking() {
    let mut t = tracker("/a");
    assert!(t.is_valid_directory("/exists", &FakeSession));
    assert!(!t.is_valid_directory("/nope", &FakeSession));

    t.on_command("cd /nope");
    assert_eq!(t.current(), "/nope");
}
