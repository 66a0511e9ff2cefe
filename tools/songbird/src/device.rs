use crate::config::DeviceConfig;
use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use crate::runtime::{FileSystem, ProcessRequest, ProcessRunner};
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};

pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn discover(
        &self,
        runner: &dyn ProcessRunner,
        fs: &dyn FileSystem,
    ) -> Result<Option<PathBuf>, SongbirdError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub path: PathBuf,
    pub strategy: &'static str,
}

/// Ordered discovery strategies; the first one that yields a path wins.
pub struct DeviceLocator {
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
}

impl DeviceLocator {
    pub fn new(strategies: Vec<Box<dyn DiscoveryStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn from_config(cfg: &DeviceConfig) -> Self {
        let mut strategies: Vec<Box<dyn DiscoveryStrategy>> = Vec::new();
        if !cfg.usb_query_command.is_empty() {
            strategies.push(Box::new(UsbQueryStrategy {
                command: cfg.usb_query_command.clone(),
                vendor_signature: cfg.vendor_signature.clone(),
            }));
        }
        if !cfg.serial_globs.is_empty() {
            strategies.push(Box::new(GlobStrategy {
                patterns: cfg.serial_globs.clone(),
            }));
        }
        if !cfg.scan_prefixes.is_empty() {
            strategies.push(Box::new(DirectoryScanStrategy {
                dir: cfg.scan_dir.clone(),
                prefixes: cfg.scan_prefixes.clone(),
            }));
        }
        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn locate(&self, runner: &dyn ProcessRunner, fs: &dyn FileSystem) -> Option<Discovery> {
        for strategy in &self.strategies {
            match strategy.discover(runner, fs) {
                Ok(Some(path)) => {
                    append_run_log(
                        "info",
                        "device.discovered",
                        json!({
                            "strategy": strategy.name(),
                            "device_path": path.display().to_string(),
                        }),
                    );
                    return Some(Discovery {
                        path,
                        strategy: strategy.name(),
                    });
                }
                Ok(None) => {
                    append_run_log(
                        "debug",
                        "device.strategy.no_match",
                        json!({ "strategy": strategy.name() }),
                    );
                }
                Err(err) => {
                    append_run_log(
                        "warn",
                        "device.strategy.error",
                        json!({ "strategy": strategy.name(), "error": err.to_string() }),
                    );
                }
            }
        }
        None
    }
}

/// Runs a structured USB listing and picks the device node named in the block that
/// carries the vendor signature.
pub struct UsbQueryStrategy {
    pub command: Vec<String>,
    pub vendor_signature: String,
}

impl DiscoveryStrategy for UsbQueryStrategy {
    fn name(&self) -> &'static str {
        "usb_query"
    }

    fn discover(
        &self,
        runner: &dyn ProcessRunner,
        _fs: &dyn FileSystem,
    ) -> Result<Option<PathBuf>, SongbirdError> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(None);
        };
        let output = runner.run(ProcessRequest::new(program.clone(), args.iter().cloned()))?;
        if !output.success() {
            return Err(SongbirdError::Process(format!(
                "{program} exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(device_node_for_vendor(&output.stdout, &self.vendor_signature))
    }
}

fn device_node_for_vendor(listing: &str, vendor_signature: &str) -> Option<PathBuf> {
    let needle = vendor_signature.to_ascii_lowercase();
    let node = Regex::new(r"/dev/[A-Za-z0-9._-]+").ok()?;

    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in listing.lines() {
        if line.contains("+-o") || blocks.is_empty() {
            blocks.push(Vec::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    blocks
        .iter()
        .filter(|block| {
            block
                .iter()
                .any(|line| line.to_ascii_lowercase().contains(&needle))
        })
        .find_map(|block| {
            block
                .iter()
                .find_map(|line| node.find(line).map(|m| PathBuf::from(m.as_str())))
        })
}

/// Matches shell-style patterns such as `/dev/cu.usbmodem*` against directory listings.
pub struct GlobStrategy {
    pub patterns: Vec<String>,
}

impl DiscoveryStrategy for GlobStrategy {
    fn name(&self) -> &'static str {
        "glob"
    }

    fn discover(
        &self,
        _runner: &dyn ProcessRunner,
        fs: &dyn FileSystem,
    ) -> Result<Option<PathBuf>, SongbirdError> {
        for pattern in &self.patterns {
            let pattern_path = Path::new(pattern);
            let (Some(dir), Some(file_pattern)) = (
                pattern_path.parent(),
                pattern_path.file_name().and_then(|name| name.to_str()),
            ) else {
                continue;
            };
            let matcher = glob_to_regex(file_pattern)?;
            let Ok(entries) = fs.list_dir(dir) else {
                continue;
            };
            let hit = entries.into_iter().find(|entry| {
                entry
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| matcher.is_match(name))
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, SongbirdError> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| SongbirdError::InvalidConfig(format!("glob {pattern}: {e}")))
}

/// Last resort: any entry in the device directory whose name starts with a known prefix.
/// Earlier prefixes take priority.
pub struct DirectoryScanStrategy {
    pub dir: PathBuf,
    pub prefixes: Vec<String>,
}

impl DiscoveryStrategy for DirectoryScanStrategy {
    fn name(&self) -> &'static str {
        "directory_scan"
    }

    fn discover(
        &self,
        _runner: &dyn ProcessRunner,
        fs: &dyn FileSystem,
    ) -> Result<Option<PathBuf>, SongbirdError> {
        let entries = fs.list_dir(&self.dir)?;
        Ok(self.prefixes.iter().find_map(|prefix| {
            entries
                .iter()
                .find(|entry| {
                    entry
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(prefix.as_str()))
                })
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeFileSystem, FakeProcess, FakeProcessRunner, ProcessOutput};

    const IOREG_LISTING: &str = r#"
+-o Root  <class IORegistryEntry>
  +-o Apple Keyboard@14100000  <class IOUSBHostDevice>
  |   "USB Product Name" = "Apple Keyboard"
  |   "IOCalloutDevice" = "/dev/cu.keyboard"
  +-o Songbird FX@14200000  <class IOUSBHostDevice>
  |   "USB Vendor Name" = "Songbird Labs"
  |   "IOCalloutDevice" = "/dev/cu.usbmodem14201"
"#;

    fn dev_fs(names: &[&str]) -> FakeFileSystem {
        let fs = FakeFileSystem::default();
        for name in names {
            fs.write_string(&Path::new("/dev").join(name), "")
                .expect("seed");
        }
        fs
    }

    #[test]
    fn usb_query_picks_node_from_vendor_block() {
        assert_eq!(
            device_node_for_vendor(IOREG_LISTING, "songbird"),
            Some(PathBuf::from("/dev/cu.usbmodem14201"))
        );
        assert_eq!(device_node_for_vendor(IOREG_LISTING, "Teensy"), None);
    }

    #[test]
    fn glob_strategy_matches_star_patterns() {
        let fs = dev_fs(&["ttyS0", "ttyACM3", "ttyACM1"]);
        let strategy = GlobStrategy {
            patterns: vec!["/dev/cu.usbmodem*".to_string(), "/dev/ttyACM*".to_string()],
        };
        let runner = FakeProcessRunner::default();
        assert_eq!(
            strategy.discover(&runner, &fs).expect("discover"),
            Some(PathBuf::from("/dev/ttyACM1"))
        );
    }

    #[test]
    fn locator_falls_through_failed_strategies_in_order() {
        let fs = dev_fs(&["ttyUSB0"]);
        let runner = FakeProcessRunner::with_handler(|_| {
            FakeProcess::SpawnError("ioreg: not found".to_string())
        });
        let cfg = crate::config::AppConfig::default().device;
        let locator = DeviceLocator::from_config(&cfg);
        assert_eq!(
            locator.strategy_names(),
            vec!["usb_query", "glob", "directory_scan"]
        );

        let found = locator.locate(&runner, &fs).expect("found");
        assert_eq!(found.strategy, "directory_scan");
        assert_eq!(found.path, PathBuf::from("/dev/ttyUSB0"));
    }

    #[test]
    fn locator_prefers_usb_query_when_it_matches() {
        let fs = dev_fs(&["ttyACM0"]);
        let runner =
            FakeProcessRunner::with_handler(|_| FakeProcess::Exit(ProcessOutput::ok(IOREG_LISTING)));
        let locator = DeviceLocator::from_config(&crate::config::AppConfig::default().device);
        let found = locator.locate(&runner, &fs).expect("found");
        assert_eq!(found.strategy, "usb_query");
    }

    #[test]
    fn nothing_found_returns_none() {
        let fs = dev_fs(&["null", "ttyS0"]);
        let runner = FakeProcessRunner::with_handler(|_| FakeProcess::Exit(ProcessOutput::ok("")));
        let locator = DeviceLocator::from_config(&crate::config::AppConfig::default().device);
        assert!(locator.locate(&runner, &fs).is_none());
    }
}
