//! OS package managers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runner::{CommandRunner, CommandSpec};

const OS_RELEASE: &str = "/etc/os-release";

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian, Ubuntu and derivatives
    Apt,
    /// Fedora, RHEL and derivatives
    Dnf,
}

impl PackageManager {
    /// Detect the package manager from `/etc/os-release`
    pub fn detect() -> Result<Self> {
        Self::detect_at(Path::new(OS_RELEASE))
    }

    pub fn detect_at(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_os_release(&content).ok_or_else(|| {
            Error::Unsupported(format!(
                "no supported package manager for the distribution in {}",
                path.display()
            ))
        })
    }

    /// Pick a package manager from os-release content (`ID` and `ID_LIKE`)
    pub fn from_os_release(content: &str) -> Option<Self> {
        let ids: Vec<String> = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .filter(|(key, _)| matches!(key.trim(), "ID" | "ID_LIKE"))
            .flat_map(|(_, value)| {
                value
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .map(str::to_lowercase)
                    .collect::<Vec<_>>()
            })
            .collect();

        ids.iter().find_map(|id| match id.as_str() {
            "debian" | "ubuntu" => Some(Self::Apt),
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => Some(Self::Dnf),
            _ => None,
        })
    }

    /// Whether a package is installed
    pub fn is_installed(&self, runner: &dyn CommandRunner, package: &str) -> Result<bool> {
        match self {
            Self::Apt => {
                let output = runner.run(
                    &CommandSpec::new("dpkg-query").args(["-W", "-f=${Status}", package]),
                )?;
                Ok(output.success() && output.stdout.contains("install ok installed"))
            }
            Self::Dnf => {
                let output = runner.run(&CommandSpec::new("rpm").args(["-q", package]))?;
                Ok(output.success())
            }
        }
    }

    /// Packages from `packages` that are not installed, in order
    pub fn missing(&self, runner: &dyn CommandRunner, packages: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for package in packages {
            if !self.is_installed(runner, package)? {
                missing.push(package.clone());
            }
        }
        Ok(missing)
    }

    /// Refresh the package index
    pub fn update_index(&self, runner: &dyn CommandRunner, timeout: Option<Duration>) -> Result<()> {
        let spec = match self {
            Self::Apt => noninteractive(CommandSpec::new("apt-get").args(["update", "-q"])),
            Self::Dnf => CommandSpec::new("dnf").args(["makecache", "-q"]),
        };
        runner.run_checked(&spec.timeout(timeout))?;
        Ok(())
    }

    /// Install packages; already installed ones are left alone
    pub fn install(
        &self,
        runner: &dyn CommandRunner,
        packages: &[String],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        log::info!("Installing with {}: {}", self, packages.join(" "));
        let spec = match self {
            Self::Apt => noninteractive(
                CommandSpec::new("apt-get").args(["install", "-y", "-q", "--no-install-recommends"]),
            ),
            Self::Dnf => CommandSpec::new("dnf").args(["install", "-y", "-q"]),
        };
        runner.run_checked(&spec.args(packages.iter().cloned()).timeout(timeout))?;
        Ok(())
    }
}

fn noninteractive(spec: CommandSpec) -> CommandSpec {
    spec.env("DEBIAN_FRONTEND", "noninteractive")
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apt => write!(f, "apt"),
            Self::Dnf => write!(f, "dnf"),
        }
    }
}
