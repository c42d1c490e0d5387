//! External tool detection and management.
//!
//! The [`ToolRegistry`] discovers and caches the locations of ffmpeg and
//! ffprobe and checks their versions against the minimum the command
//! builder relies on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use ef_core::config::ToolsConfig;
use ef_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;

pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &[FFMPEG, FFPROBE];

/// `-progress`, `-hls_segment_type fmp4` and `-force_key_frames expr:` all
/// need a reasonably recent ffmpeg.
const MIN_FFMPEG_VERSION: &str = ">=4.4.0";

/// Configuration for a single external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    /// Resolved path to the executable.
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<semver::VersionReq>,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// Parsed version, if the tool reported one.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    /// Whether the version satisfies the minimum requirement. `None` when the
    /// version could not be determined.
    pub version_ok: Option<bool>,
}

/// Registry holding discovered tool configurations.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Discover tools, preferring configured paths and falling back to `PATH`.
    ///
    /// Tools that are not found are omitted; [`require`](Self::require)
    /// reports them when they are actually needed.
    pub fn discover(config: &ToolsConfig) -> Self {
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom = match name {
                FFMPEG => config.ffmpeg_path.as_deref(),
                FFPROBE => config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match custom {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!(tool = name, path = %p.display(), "Configured tool path does not exist, searching PATH");
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            match resolved {
                Some(path) => {
                    tracing::debug!(tool = name, path = %path.display(), "Discovered tool");
                    tools.insert(
                        name.to_string(),
                        ToolConfig {
                            name: name.to_string(),
                            path,
                            min_version: semver::VersionReq::parse(MIN_FFMPEG_VERSION).ok(),
                        },
                    );
                }
                None => tracing::debug!(tool = name, "Tool not found"),
            }
        }

        Self { tools }
    }

    /// Registry with explicit paths, bypassing discovery.
    pub fn with_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        let mut tools = HashMap::new();
        for (name, path) in [(FFMPEG, ffmpeg.into()), (FFPROBE, ffprobe.into())] {
            tools.insert(
                name.to_string(),
                ToolConfig {
                    name: name.to_string(),
                    path,
                    min_version: None,
                },
            );
        }
        Self { tools }
    }

    /// Return the config for `name`, or [`Error::Tool`] if it was not found.
    pub fn require(&self, name: &str) -> Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| {
            Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    pub fn ffmpeg(&self) -> Result<&Path> {
        self.require(FFMPEG).map(|t| t.path.as_path())
    }

    pub fn ffprobe(&self) -> Result<&Path> {
        self.require(FFPROBE).map(|t| t.path.as_path())
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(cfg) => {
                    let version = detect_version(&cfg.path);
                    let version_ok = match (&version, &cfg.min_version) {
                        (Some(v), Some(req)) => Some(req.matches(v)),
                        (Some(_), None) => Some(true),
                        (None, _) => None,
                    };
                    ToolInfo {
                        name: name.to_string(),
                        available: true,
                        version: version.map(|v| v.to_string()),
                        path: Some(cfg.path.clone()),
                        version_ok,
                    }
                }
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                    version_ok: None,
                },
            })
            .collect()
    }

    /// Raw `ffmpeg -encoders` listing, for the codec registry to parse.
    pub async fn encoder_listing(&self) -> Result<String> {
        let ffmpeg = self.ffmpeg()?;
        let output = ToolCommand::new(ffmpeg.to_path_buf())
            .args(["-hide_banner", "-encoders"])
            .timeout(Duration::from_secs(30))
            .execute()
            .await?;
        Ok(output.stdout)
    }
}

/// Run `<tool> -version` and parse the semantic version from the first line.
fn detect_version(path: &Path) -> Option<semver::Version> {
    let output = std::process::Command::new(path).arg("-version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(stdout.lines().next()?)
}

/// Parse the version out of a banner such as `ffmpeg version 6.1.1-3ubuntu5`
/// or `ffprobe version n7.0`. Two-component versions get a zero patch.
pub fn parse_version(banner: &str) -> Option<semver::Version> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"version\s+n?(\d+)\.(\d+)(?:\.(\d+))?").expect("valid regex")
    });
    let caps = RE.captures(banner)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    let patch = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
    Some(semver::Version::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_with_default_config() {
        let registry = ToolRegistry::discover(&ToolsConfig::default());
        // Nothing guaranteed to be installed; the call must not panic.
        let infos = registry.check_all();
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ffmpeg", "ffprobe"]);
    }

    #[test]
    fn require_missing_tool_returns_error() {
        let registry = ToolRegistry::default();
        let err = registry.require("ffmpeg").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn explicit_paths() {
        let registry = ToolRegistry::with_paths("/opt/ff/ffmpeg", "/opt/ff/ffprobe");
        assert_eq!(registry.ffmpeg().unwrap(), Path::new("/opt/ff/ffmpeg"));
        assert_eq!(registry.ffprobe().unwrap(), Path::new("/opt/ff/ffprobe"));
    }

    #[test]
    fn version_banners() {
        assert_eq!(
            parse_version("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023"),
            Some(semver::Version::new(6, 1, 1))
        );
        assert_eq!(
            parse_version("ffprobe version n7.0 Copyright (c) 2007-2024"),
            Some(semver::Version::new(7, 0, 0))
        );
        assert_eq!(parse_version("ffmpeg version N-112345-gdeadbeef"), None);
    }

    #[test]
    fn minimum_version() {
        let req = semver::VersionReq::parse(MIN_FFMPEG_VERSION).unwrap();
        assert!(req.matches(&semver::Version::new(6, 1, 1)));
        assert!(!req.matches(&semver::Version::new(4, 2, 7)));
    }
}
