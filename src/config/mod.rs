//! Interpreter configuration
//!
//! Runtime flags that change language semantics, workspace sizing and the
//! options read from the `brandyrc` file. The command line layer in `main.rs`
//! starts from [`Config::load_rc`] and overrides individual fields.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Smallest workspace the interpreter will run in
pub const MIN_WORKSPACE: usize = 16 * 1024;
/// Workspace size used when nothing else is configured
pub const DEFAULT_WORKSPACE: usize = 1024 * 1024;
/// Largest workspace, limited by the 32-bit address space BASIC sees
pub const MAX_WORKSPACE: usize = 0x7FFF_0000;

/// All runtime options
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Workspace size in bytes
    pub size: usize,
    /// Directories searched for LOAD/CHAIN/LIBRARY
    pub path: Vec<PathBuf>,
    /// Libraries to INSTALL at startup
    pub libs: Vec<PathBuf>,
    /// Screen mode selected at startup
    pub startup_mode: u32,
    /// Skip program structure checks on load
    pub nocheck: bool,
    /// Suppress cosmetic warnings
    pub ignore: bool,
    /// Promote behaviour warnings to errors
    pub strict: bool,
    /// Tektronix graphics in text mode
    pub tek_enabled: bool,
    /// Disable the built-in `*` commands
    pub nostar: bool,
    /// Integer arithmetic results may overflow into floating point
    pub int_uses_float: bool,
    /// Pre-BASIC VI integer semantics (wrap modulo 2^32)
    pub legacy_int_maths: bool,
    /// Hex literals and `~` formatting are 64-bit
    pub hex64: bool,
    /// Shift operators work in 64-bit space
    pub bitshift64: bool,
    /// Pseudo-variables such as `PAGE` and `HIMEM` read as unsigned
    pub pseudovars_unsigned: bool,
    /// DEL (127) behaves as backspace in the line editor
    pub del_is_bs: bool,
    /// Alternative resolution of cascaded `IF ... ELSE IF` in block IFs
    pub cascaded_if_tweak: bool,
    /// Screen mode used when a requested mode is not available (-1 = error)
    pub failover_mode: i32,
    /// Mouse events expire after this many centiseconds (0 = never)
    pub mouse_event_expire: u32,
    pub fullscreen: bool,
    pub swsurface: bool,
    /// Ceiling on nested PROC/FN calls and flood fill depth
    pub max_recursion: usize,
}

impl Config {
    /// Create the default configuration
    pub fn new() -> Self {
        Self {
            size: DEFAULT_WORKSPACE,
            path: Vec::new(),
            libs: Vec::new(),
            startup_mode: 0,
            nocheck: false,
            ignore: false,
            strict: false,
            tek_enabled: false,
            nostar: false,
            int_uses_float: false,
            legacy_int_maths: false,
            hex64: false,
            bitshift64: false,
            pseudovars_unsigned: false,
            del_is_bs: true,
            cascaded_if_tweak: false,
            failover_mode: -1,
            mouse_event_expire: 0,
            fullscreen: false,
            swsurface: false,
            max_recursion: 2000,
        }
    }

    /// Location of the rc file for this platform
    pub fn rc_path() -> Option<PathBuf> {
        if cfg!(windows) {
            std::env::var_os("APPDATA").map(|dir| Path::new(&dir).join("brandyrc"))
        } else {
            std::env::var_os("HOME").map(|dir| Path::new(&dir).join(".brandyrc"))
        }
    }

    /// Defaults overlaid with the rc file, if there is one
    pub fn load_rc() -> Self {
        let mut config = Config::new();
        if let Some(path) = Config::rc_path() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                debug!(path = %path.display(), "reading rc file");
                config.apply_rc(&text);
            }
        }
        config
    }

    /// Apply `key=value` lines. Unknown keys are logged and skipped.
    pub fn apply_rc(&mut self, text: &str) {
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (line, None),
            };
            if !self.set_option(key, value) {
                warn!(key, "unknown or malformed rc file option");
            }
        }
    }

    /// Set one option by name. Returns false if the key is unknown or the
    /// value does not parse.
    pub fn set_option(&mut self, key: &str, value: Option<&str>) -> bool {
        let flag = |v: Option<&str>| match v {
            None => Some(true),
            Some(v) => parse_bool(v),
        };
        match key.to_ascii_lowercase().as_str() {
            "size" => match value.and_then(parse_size) {
                Some(size) => self.size = size,
                None => return false,
            },
            "path" => match value {
                Some(v) => self.path = split_path(v),
                None => return false,
            },
            "lib" => match value {
                Some(v) => self.libs.push(PathBuf::from(v)),
                None => return false,
            },
            "startupmode" => match value.and_then(|v| v.parse().ok()) {
                Some(mode) => self.startup_mode = mode,
                None => return false,
            },
            "failovermode" => match value.and_then(|v| v.parse().ok()) {
                Some(mode) => self.failover_mode = mode,
                None => return false,
            },
            "mouseeventexpire" => match value.and_then(|v| v.parse().ok()) {
                Some(cs) => self.mouse_event_expire = cs,
                None => return false,
            },
            "maxrecursion" => match value.and_then(|v| v.parse().ok()) {
                Some(depth) => self.max_recursion = depth,
                None => return false,
            },
            other => {
                let target = match other {
                    "nocheck" => &mut self.nocheck,
                    "ignore" => &mut self.ignore,
                    "strict" => &mut self.strict,
                    "tek" => &mut self.tek_enabled,
                    "nostar" => &mut self.nostar,
                    "intusesfloat" => &mut self.int_uses_float,
                    "legacyintmaths" => &mut self.legacy_int_maths,
                    "hex64" => &mut self.hex64,
                    "bitshift64" => &mut self.bitshift64,
                    "pseudovarsunsigned" => &mut self.pseudovars_unsigned,
                    "delisbs" => &mut self.del_is_bs,
                    "cascadediftweak" => &mut self.cascaded_if_tweak,
                    "fullscreen" => &mut self.fullscreen,
                    "swsurface" => &mut self.swsurface,
                    "nofull" => {
                        return match flag(value) {
                            Some(v) => {
                                self.fullscreen = !v;
                                true
                            }
                            None => false,
                        }
                    }
                    _ => return false,
                };
                match flag(value) {
                    Some(v) => *target = v,
                    None => return false,
                }
            }
        }
        true
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "yes" | "on" | "true" => Some(true),
        "0" | "no" | "off" | "false" => Some(false),
        _ => None,
    }
}

fn split_path(text: &str) -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    text.split(|c| c == sep || c == ',')
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Parse a workspace size: `N`, `NK`, `NM` or `NG`. The result is clamped
/// to the supported range and rounded down to a multiple of 256.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last()?.to_ascii_uppercase() {
        'K' => (&text[..text.len() - 1], 1024usize),
        'M' => (&text[..text.len() - 1], 1024 * 1024),
        'G' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let value: usize = digits.trim().parse().ok()?;
    let size = value.checked_mul(multiplier)?;
    Some(size.clamp(MIN_WORKSPACE, MAX_WORKSPACE) & !0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("100"), Some(MIN_WORKSPACE));
        assert_eq!(parse_size("junk"), None);
    }

    #[test]
    fn test_rc_file_options() {
        let mut config = Config::new();
        config.apply_rc("# comment\nsize=256K\nhex64\nlegacyintmaths=no\nstartupmode = 12\nbogus=1\n");
        assert_eq!(config.size, 256 * 1024);
        assert!(config.hex64);
        assert!(!config.legacy_int_maths);
        assert_eq!(config.startup_mode, 12);
    }

    #[test]
    fn test_nofull_inverts_fullscreen() {
        let mut config = Config::new();
        config.fullscreen = true;
        assert!(config.set_option("nofull", None));
        assert!(!config.fullscreen);
    }

    #[test]
    fn test_path_list() {
        let mut config = Config::new();
        assert!(config.set_option("path", Some("lib,progs")));
        assert_eq!(config.path, vec![PathBuf::from("lib"), PathBuf::from("progs")]);
    }
}
