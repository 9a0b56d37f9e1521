//! On-demand dependency resolution for submitted code.
//!
//! Imports are scanned statically, probed against the runtime, and whatever
//! is missing is installed into the worker's private site directory. A
//! failed install is logged and otherwise ignored: the run proceeds and the
//! import error surfaces as an ordinary execution error.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use runcell_config::WorkerConfig;
use tracing::{debug, info, warn};

use super::process::{BoundedProcess, ProcessOptions};
use super::runtime::Runtime;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*import\s+(?P<names>[\w.]+(?:\s+as\s+\w+)?(?:\s*,\s*[\w.]+(?:\s+as\s+\w+)?)*)")
        .unwrap_or_else(|err| panic!("invalid import pattern: {err}"))
});

static FROM_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*from\s+(?P<module>\.*[\w.]*)\s+import\b")
        .unwrap_or_else(|err| panic!("invalid from-import pattern: {err}"))
});

const INSTALL_CAPTURE_LIMIT: usize = 16 * 1024; // 16 KiB

/// Import names whose distribution package is named differently.
const PACKAGE_ALIASES: &[(&str, &str)] = &[
    ("sklearn", "scikit-learn"),
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("bs4", "beautifulsoup4"),
    ("yaml", "pyyaml"),
    ("dateutil", "python-dateutil"),
    ("skimage", "scikit-image"),
    ("Crypto", "pycryptodome"),
    ("docx", "python-docx"),
    ("pptx", "python-pptx"),
    ("dotenv", "python-dotenv"),
    ("attr", "attrs"),
    ("serial", "pyserial"),
    ("jwt", "pyjwt"),
    ("fitz", "pymupdf"),
];

/// Top-level modules imported by `code`, in first-seen order.
///
/// Relative imports and `__future__` are skipped. Only line-leading
/// statements are recognised, so imports inside strings that happen to
/// start a line are reported too; probing filters those out cheaply.
pub fn scan_imports(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut modules = Vec::new();
    let mut push = |dotted: &str| {
        let Some(top) = dotted.split('.').next() else {
            return;
        };
        if top.is_empty() || top == "__future__" {
            return;
        }
        if seen.insert(top.to_owned()) {
            modules.push(top.to_owned());
        }
    };

    for line in code.lines() {
        let line = line.split('#').next().unwrap_or_default();
        if let Some(names) = IMPORT_RE.captures(line).and_then(|caps| caps.name("names")) {
            for clause in names.as_str().split(',') {
                if let Some(name) = clause.split_whitespace().next() {
                    push(name);
                }
            }
        } else if let Some(module) = FROM_IMPORT_RE
            .captures(line)
            .and_then(|caps| caps.name("module"))
            && !module.as_str().starts_with('.')
        {
            push(module.as_str());
        }
    }
    modules
}

/// Maps import names to installable package names.
#[derive(Debug, Clone)]
pub struct PackageMap {
    overrides: BTreeMap<String, String>,
}

impl PackageMap {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn package_for<'a>(&'a self, module: &'a str) -> &'a str {
        if let Some(package) = self.overrides.get(module) {
            return package;
        }
        PACKAGE_ALIASES
            .iter()
            .find(|(name, _)| *name == module)
            .map_or(module, |(_, package)| *package)
    }
}

/// Installs packages into a target directory with `pip`.
#[derive(Debug, Clone)]
pub struct PackageInstaller {
    python: String,
    target: PathBuf,
    timeout: Duration,
}

impl PackageInstaller {
    pub fn new(python: impl Into<String>, target: PathBuf, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            target,
            timeout,
        }
    }

    pub async fn install(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }

        let mut args: Vec<String> = [
            "-m",
            "pip",
            "install",
            "--quiet",
            "--disable-pip-version-check",
            "--no-input",
            "--target",
        ]
        .iter()
        .map(|arg| (*arg).to_owned())
        .collect();
        args.push(self.target.display().to_string());
        args.extend(packages.iter().cloned());

        let output = BoundedProcess::run(ProcessOptions {
            program: self.python.clone(),
            args,
            timeout: Some(self.timeout),
            capture_limit: INSTALL_CAPTURE_LIMIT,
        })
        .await?;

        if output.timed_out {
            bail!("pip install timed out after {:?}", self.timeout);
        }
        if !output.success() {
            bail!("pip install failed: {}", output.stderr_tail(5));
        }
        debug!(?packages, elapsed = ?output.duration, "packages installed");
        Ok(())
    }
}

/// What a resolution pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub installed: Vec<String>,
    pub failed: Vec<String>,
}

/// Installs whatever a submission imports but the runtime cannot find.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    packages: PackageMap,
    installer: PackageInstaller,
    enabled: bool,
}

impl DependencyResolver {
    pub fn new(config: &WorkerConfig, target: PathBuf) -> Self {
        Self {
            packages: PackageMap::new(config.package_aliases.clone()),
            installer: PackageInstaller::new(config.python.clone(), target, config.install_timeout()),
            enabled: config.auto_install,
        }
    }

    /// Ensures `modules` are importable, installing the missing ones.
    ///
    /// An `Err` is returned only when the runtime itself fails.
    pub async fn ensure_modules(
        &self,
        runtime: &mut dyn Runtime,
        modules: &[String],
    ) -> Result<Resolution> {
        if !self.enabled || modules.is_empty() {
            return Ok(Resolution::default());
        }

        let missing = runtime.probe_missing(modules).await?;
        if missing.is_empty() {
            return Ok(Resolution::default());
        }

        let mut resolution = Resolution::default();
        let mut requested = HashSet::new();
        for module in &missing {
            let package = self.packages.package_for(module).to_owned();
            if !requested.insert(package.clone()) {
                continue;
            }
            info!(%module, %package, "installing missing package");
            match self.installer.install(std::slice::from_ref(&package)).await {
                Ok(()) => resolution.installed.push(package),
                Err(err) => {
                    warn!(%package, error = %err, "package installation failed");
                    resolution.failed.push(package);
                }
            }
        }
        Ok(resolution)
    }

    pub async fn resolve_code(&self, runtime: &mut dyn Runtime, code: &str) -> Result<Resolution> {
        let modules = scan_imports(code);
        self.ensure_modules(runtime, &modules).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scans_plain_and_from_imports() {
        let code = "\
import numpy as np, os.path
from sklearn.linear_model import LinearRegression
from . import sibling
from __future__ import annotations
import numpy
    import yaml  # indented inside a block
x = 1  # import notamodule
";
        assert_eq!(scan_imports(code), vec!["numpy", "os", "sklearn", "yaml"]);
    }

    #[test]
    fn ignores_identifiers_containing_import() {
        assert!(scan_imports("important = 1\nreimport(x)\n").is_empty());
    }

    #[test]
    fn maps_aliases_with_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("yaml".to_owned(), "ruamel.yaml".to_owned());
        let map = PackageMap::new(overrides);

        assert_eq!(map.package_for("sklearn"), "scikit-learn");
        assert_eq!(map.package_for("PIL"), "pillow");
        assert_eq!(map.package_for("yaml"), "ruamel.yaml");
        assert_eq!(map.package_for("requests"), "requests");
    }
}
