//! Built-in matrix definitions.

use crate::error::ConfigError;
use crate::matrix::MatrixPlan;
use crate::models::{Axis, Step};
use crate::profile::{EnvEntry, EnvProfile};
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Variable holding the native library installation root.
pub const INSTALL_ROOT_VAR: &str = "PSRAD_PATH";
/// Variable selecting the compiler for native builds.
pub const COMPILER_VAR: &str = "CC";
/// Library search-path variables that native roots are appended to.
pub const LIBRARY_PATH_VARS: [&str; 2] = ["LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"];
/// Suppresses the HDF5 header/library version check.
pub const VERSION_CHECK_VAR: &str = "HDF5_DISABLE_VERSION_CHECK";

lazy_static! {
    static ref PRESETS: HashMap<&'static str, MatrixPlan> = {
        let mut presets = HashMap::new();
        presets.insert("konrad", konrad());
        presets.insert("smoke", smoke());
        presets
    };
}

/// Look up a built-in plan by name (case-insensitive).
pub fn preset(name: &str) -> Result<MatrixPlan, ConfigError> {
    PRESETS
        .get(name.to_lowercase().as_str())
        .cloned()
        .ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))
}

/// Names of all built-in plans, sorted.
pub fn preset_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PRESETS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Python package CI: optional native radiative-transfer library on Linux,
/// install with extras, lint, test, docs.
fn konrad() -> MatrixPlan {
    let actions = BTreeMap::from([
        (
            "checkout".to_string(),
            "git clone --quiet --depth 1 \"$REPO_URL\" .".to_string(),
        ),
        (
            "setup-python".to_string(),
            "python${MATRIX_PYTHON} -m venv .venv && python --version".to_string(),
        ),
        (
            "build-psrad".to_string(),
            concat!(
                "git clone --quiet --depth 1 \"$PSRAD_REPO_URL\" .psrad-src && ",
                "cd .psrad-src && ",
                "./configure --prefix=\"$PSRAD_PATH\" CC=\"$CC\" && ",
                "make && make install"
            )
            .to_string(),
        ),
    ]);

    let profile = EnvProfile::new(vec![
        EnvEntry::set("REPO_URL", "https://github.com/atmtools/konrad.git"),
        EnvEntry::set("PSRAD_REPO_URL", "https://github.com/atmtools/psrad.git"),
        EnvEntry::set(INSTALL_ROOT_VAR, "${HOME}/psrad"),
        EnvEntry::set(COMPILER_VAR, "gcc"),
        EnvEntry::prepend("PATH", "${PSRAD_PATH}/bin"),
        EnvEntry::prepend("PATH", "${MATRIX_WORKSPACE}/.venv/bin"),
        EnvEntry::append(LIBRARY_PATH_VARS[0], "${PSRAD_PATH}/lib"),
        EnvEntry::append(LIBRARY_PATH_VARS[1], "${PSRAD_PATH}/lib"),
        EnvEntry::set(VERSION_CHECK_VAR, "1"),
    ]);

    MatrixPlan {
        name: "build".to_string(),
        platform_axis: "os".to_string(),
        job_timeout_secs: Some(3600),
        axes: vec![
            Axis::new("os", ["ubuntu-latest", "macos-latest"]),
            Axis::new("python", ["3.8", "3.9", "3.10"]),
        ],
        profile,
        actions,
        steps: vec![
            Step::uses("checkout", "checkout"),
            Step::uses("setup-python", "setup-python"),
            Step::uses("install-psrad", "build-psrad")
                .only(["ubuntu-*"])
                .with_timeout(Duration::from_secs(1200)),
            Step::run("install", "pip install --upgrade pip && pip install '.[docs,tests]'"),
            Step::run("lint", "flake8 . --count --statistics").tolerant(),
            Step::run("test", "pytest -v --pyargs konrad"),
            Step::run("docs", "make -C docs html").tolerant(),
        ],
    }
}

/// Host-only sanity check of the orchestrator itself.
fn smoke() -> MatrixPlan {
    MatrixPlan {
        name: "smoke".to_string(),
        platform_axis: "os".to_string(),
        job_timeout_secs: Some(60),
        axes: vec![Axis::new("os", [std::env::consts::OS])],
        profile: EnvProfile::new(vec![EnvEntry::set("GREETING", "hello from ${MATRIX_OS}")]),
        actions: BTreeMap::new(),
        steps: vec![
            Step::run("env", "echo \"$GREETING\""),
            Step::run("workspace", "touch marker && test -f marker"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailurePolicy, PlatformGuard};

    #[test]
    fn test_preset_names() {
        assert_eq!(preset_names(), vec!["konrad", "smoke"]);
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(preset("nope"), Err(ConfigError::UnknownPreset(_))));
    }

    #[test]
    fn test_konrad_preset_is_valid() {
        let plan = preset("Konrad").unwrap();
        let jobs = plan.jobs().unwrap();
        assert_eq!(jobs.len(), 6);
        assert_eq!(jobs[0].id, "build (ubuntu-latest, 3.8)");
        assert_eq!(jobs[5].id, "build (macos-latest, 3.10)");
    }

    #[test]
    fn test_konrad_step_policies() {
        let plan = preset("konrad").unwrap();
        let by_name = |n: &str| plan.steps.iter().find(|s| s.name == n).unwrap();

        assert_eq!(by_name("lint").on_failure, FailurePolicy::Tolerant);
        assert_eq!(by_name("docs").on_failure, FailurePolicy::Tolerant);
        assert_eq!(by_name("test").on_failure, FailurePolicy::Fatal);
        assert_eq!(
            by_name("install-psrad").guard,
            PlatformGuard::Only(vec!["ubuntu-*".to_string()])
        );
    }

    #[test]
    fn test_konrad_profile_accumulates_library_path() {
        let plan = preset("konrad").unwrap();
        let base = BTreeMap::from([
            ("HOME".to_string(), "/home/ci".to_string()),
            ("LD_LIBRARY_PATH".to_string(), "/usr/lib".to_string()),
        ]);
        let env = plan.profile.resolve(&base).unwrap();
        assert_eq!(env["PSRAD_PATH"], "/home/ci/psrad");
        assert_eq!(env["LD_LIBRARY_PATH"], "/usr/lib:/home/ci/psrad/lib");
        assert_eq!(env["DYLD_LIBRARY_PATH"], "/home/ci/psrad/lib");
        assert_eq!(env[VERSION_CHECK_VAR], "1");
    }
}
