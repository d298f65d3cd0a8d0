/// On-disk run scripts (start/stop/launch) replaced during upgrade.
use crate::errors::DaemonResult;
use delegate_core::ScriptBundle;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// rwxr--r--
pub const SCRIPT_MODE: u32 = 0o744;

/// Writes every named script present in `bundle` into `dir`.
///
/// Each script is written beside its target and renamed over it, then made
/// executable. Names missing from the bundle (or blank) are skipped. Returns
/// the paths written.
pub fn write_scripts(dir: &Path, bundle: &ScriptBundle, names: &[&str]) -> DaemonResult<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for name in names {
        let Some(body) = bundle.script(name) else {
            debug!("Script {} not in bundle, leaving it as is", name);
            continue;
        };
        let target = dir.join(name);
        let staged = dir.join(format!("{}.new", name));
        fs::write(&staged, body)?;
        fs::rename(&staged, &target)?;
        set_executable(&target)?;
        info!("Wrote script {}", target.display());
        written.push(target);
    }
    Ok(written)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> DaemonResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(SCRIPT_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> DaemonResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use delegate_core::task::{START_SCRIPT, STOP_SCRIPT};
    use tempfile::TempDir;

    fn bundle() -> ScriptBundle {
        let mut bundle = ScriptBundle {
            version: "2.0.0".to_string(),
            do_upgrade: true,
            ..ScriptBundle::default()
        };
        bundle.scripts.insert(START_SCRIPT.to_string(), "#!/bin/bash\necho start\n".to_string());
        bundle.scripts.insert(STOP_SCRIPT.to_string(), "   ".to_string());
        bundle
    }

    #[test]
    fn test_writes_present_scripts_only() {
        let dir = TempDir::new().unwrap();
        let written = write_scripts(dir.path(), &bundle(), &[START_SCRIPT, STOP_SCRIPT]).unwrap();

        assert_eq!(written, vec![dir.path().join(START_SCRIPT)]);
        let body = fs::read_to_string(dir.path().join(START_SCRIPT)).unwrap();
        assert!(body.contains("echo start"));
        assert!(!dir.path().join(STOP_SCRIPT).exists());
        assert!(!dir.path().join("start.sh.new").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_scripts_are_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        write_scripts(dir.path(), &bundle(), &[START_SCRIPT]).unwrap();
        let mode = fs::metadata(dir.path().join(START_SCRIPT)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SCRIPT_MODE);
    }
}
