//! Module discovery
//!
//! Scans the module directory and probes candidate files for the extension
//! marker.

use memchr::memmem;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::module::traits::{ModuleError, ModuleMetadata, EXTENSION_MARKER};
use crate::severity::Notifier;

/// Bytes read per step while scanning a candidate for the marker
const SCAN_CHUNK: usize = 8 * 1024;

/// Bytes kept after the marker: `:` plus the longest valid name
const NAME_LOOKAHEAD: usize = 1 + 64;

/// A candidate that passed the marker probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModule {
    /// Declared module name
    pub name: String,
    /// Path to the module executable
    pub path: PathBuf,
}

impl DiscoveredModule {
    pub fn to_metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}

/// Module discovery scanner
pub struct ModuleDiscovery {
    /// Directory to scan (not recursed into)
    modules_dir: PathBuf,
    /// Extension a candidate must carry, without the dot
    extension: String,
    notifier: Notifier,
}

impl ModuleDiscovery {
    pub fn new<P: AsRef<Path>>(modules_dir: P, extension: &str, notifier: Notifier) -> Self {
        Self {
            modules_dir: modules_dir.as_ref().to_path_buf(),
            extension: extension.to_string(),
            notifier,
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// Discover all modules in the module directory
    ///
    /// A missing directory is not an error: the daemon can run without any
    /// data source. Results are ordered by file name.
    pub fn discover_modules(&self) -> Vec<DiscoveredModule> {
        let entries = match fs::read_dir(&self.modules_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.notifier.info(format!(
                    "Module path {} does not exist, no modules loaded.",
                    self.modules_dir.display()
                ));
                return Vec::new();
            }
            Err(e) => {
                self.notifier.warning(format!(
                    "Can't read module path {}.\n{}",
                    self.modules_dir.display(),
                    e
                ));
                return Vec::new();
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| self.is_candidate(path))
            .collect();
        candidates.sort();

        let mut names = HashSet::new();
        let mut modules = Vec::new();

        for path in candidates {
            self.notifier.debug(format!(
                "Testing file {} for an gpsd-tcp extension",
                path.display()
            ));

            let name = match self.probe(&path) {
                Ok(name) => name,
                Err(e) => {
                    self.notifier.notice(format!(
                        "Tested file {} for an extension: {}",
                        path.display(),
                        e
                    ));
                    continue;
                }
            };

            if !names.insert(name.clone()) {
                self.notifier.error(format!(
                    "{} can't be processed.\n{}",
                    path.display(),
                    ModuleError::AlreadyLoaded(name)
                ));
                continue;
            }

            self.notifier
                .debug(format!("{} is an gpsd-tcp extension", path.display()));
            self.notifier.info(format!("Module {} found.", name));
            modules.push(DiscoveredModule { name, path });
        }

        modules
    }

    /// Whether a directory entry is a module candidate
    ///
    /// Only regular files with the module extension qualify.
    pub fn is_candidate(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .extension()
                .map(|ext| ext == self.extension.as_str())
                .unwrap_or(false)
    }

    /// Probe a candidate for the extension marker
    ///
    /// Returns the declared module name, or the file stem when the marker
    /// carries no name.
    pub fn probe(&self, path: &Path) -> Result<String, ModuleError> {
        let display = path.display().to_string();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o111 == 0 {
                return Err(ModuleError::NotAnExtension(display));
            }
        }

        let after_marker =
            scan_for_marker(path)?.ok_or_else(|| ModuleError::NotAnExtension(display.clone()))?;

        let declared = declared_name(&after_marker);
        let name = match declared {
            Some(name) => name,
            None => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        if !is_valid_name(&name) {
            return Err(ModuleError::InvalidName(name));
        }
        Ok(name)
    }
}

/// Find the marker in `path` without reading the whole file
///
/// Returns up to [`NAME_LOOKAHEAD`] bytes following the first marker.
fn scan_for_marker(path: &Path) -> io::Result<Option<Vec<u8>>> {
    let finder = memmem::Finder::new(EXTENSION_MARKER);
    let mut file = File::open(path)?;
    let mut chunk = vec![0u8; SCAN_CHUNK];
    let mut window: Vec<u8> = Vec::with_capacity(SCAN_CHUNK + EXTENSION_MARKER.len());

    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            return Ok(None);
        }
        window.extend_from_slice(&chunk[..read]);

        if let Some(position) = finder.find(&window) {
            let mut tail = window.split_off(position + EXTENSION_MARKER.len());
            // The declared name may continue into the next chunk
            while tail.len() < NAME_LOOKAHEAD {
                let read = file.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                tail.extend_from_slice(&chunk[..read]);
            }
            tail.truncate(NAME_LOOKAHEAD);
            return Ok(Some(tail));
        }

        // Keep enough bytes to match a marker split across chunks
        let keep = EXTENSION_MARKER.len() - 1;
        if window.len() > keep {
            window.drain(..window.len() - keep);
        }
    }
}

/// Name following the marker as `:<name>`, if any
fn declared_name(after_marker: &[u8]) -> Option<String> {
    let rest = after_marker.strip_prefix(b":")?;
    let len = rest
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'-' || **b == b'_')
        .count();
    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&rest[..len]).into_owned())
}

/// Module names: 1-64 chars, alphanumeric start, then alphanumerics, dashes, underscores
#[inline]
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }

    if !name.chars().next().map_or(false, |c| c.is_ascii_alphanumeric()) {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::severity::Severity;

    #[test]
    fn test_declared_name() {
        assert_eq!(declared_name(b":EM7345\n"), Some("EM7345".to_string()));
        assert_eq!(declared_name(b":nmea-replay rest"), Some("nmea-replay".to_string()));
        assert_eq!(declared_name(b":\n"), None);
        assert_eq!(declared_name(b"\n"), None);
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("EM7345"));
        assert!(is_valid_name("nmea_replay-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("-leading"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(&"x".repeat(65)));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, mut rx) = Notifier::with_tap(Severity::Debug);
        let discovery = ModuleDiscovery::new(dir.path().join("absent"), "module", notifier);

        assert!(discovery.discover_modules().is_empty());
        let note = rx.try_recv().unwrap();
        assert_eq!(note.severity, Severity::Information);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("far.module");
        let mut contents = vec![b'#'; SCAN_CHUNK - 7];
        contents.extend_from_slice(b"GPSD_TCP_EXTENSION:late_name\n");
        std::fs::write(&path, &contents).unwrap();

        let tail = scan_for_marker(&path).unwrap().unwrap();
        assert_eq!(declared_name(&tail), Some("late_name".to_string()));
    }

    #[test]
    fn test_name_split_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.module");
        let mut contents = vec![b' '; SCAN_CHUNK - EXTENSION_MARKER.len() - 3];
        contents.extend_from_slice(b"GPSD_TCP_EXTENSION:EM7345\n");
        std::fs::write(&path, &contents).unwrap();

        let tail = scan_for_marker(&path).unwrap().unwrap();
        assert_eq!(declared_name(&tail), Some("EM7345".to_string()));
    }

    #[test]
    fn test_scan_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.module");
        std::fs::write(&path, vec![b'x'; SCAN_CHUNK * 3 + 11]).unwrap();
        assert!(scan_for_marker(&path).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_module_rejected_with_notice() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gps.module");
        std::fs::write(&path, "#!/bin/sh\n# GPSD_TCP_EXTENSION:gps\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let (notifier, mut rx) = Notifier::with_tap(Severity::Notice);
        let discovery = ModuleDiscovery::new(dir.path(), "module", notifier);

        assert!(discovery.discover_modules().is_empty());
        let note = rx.try_recv().unwrap();
        assert_eq!(note.severity, Severity::Notice);
        assert!(note.message.contains("gps.module"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_candidate_requires_extension() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("gps.module");
        let other = dir.path().join("gps.txt");
        std::fs::write(&module, b"").unwrap();
        std::fs::write(&other, b"").unwrap();
        std::fs::create_dir(dir.path().join("nested.module")).unwrap();

        let discovery = ModuleDiscovery::new(dir.path(), "module", Notifier::new(Severity::Debug));
        assert!(discovery.is_candidate(&module));
        assert!(!discovery.is_candidate(&other));
        assert!(!discovery.is_candidate(&dir.path().join("nested.module")));
    }
}
