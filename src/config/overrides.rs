//! Environment-variable overrides applied to a plan before expansion.

use crate::config::presets::{COMPILER_VAR, INSTALL_ROOT_VAR, LIBRARY_PATH_VARS, VERSION_CHECK_VAR};
use crate::error::ConfigError;
use crate::matrix::MatrixPlan;
use crate::profile::{EnvEntry, EnvOp, EnvProfile};

pub const ENV_INSTALL_ROOT: &str = "MATRIX_CI_INSTALL_ROOT";
pub const ENV_COMPILER: &str = "MATRIX_CI_COMPILER";
pub const ENV_LIBRARY_ROOTS: &str = "MATRIX_CI_LIBRARY_ROOTS";
pub const ENV_DISABLE_VERSION_CHECK: &str = "MATRIX_CI_DISABLE_VERSION_CHECK";
pub const ENV_PLATFORMS: &str = "MATRIX_CI_PLATFORMS";
pub const ENV_TOOLCHAINS: &str = "MATRIX_CI_TOOLCHAINS";
pub const ENV_LOG: &str = "MATRIX_CI_LOG";

/// Overrides read once from the invoking environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub install_root: Option<String>,
    pub compiler: Option<String>,
    pub library_roots: Vec<String>,
    pub disable_version_check: Option<bool>,
    pub platforms: Option<Vec<String>>,
    pub toolchains: Option<Vec<String>>,
    pub log_level: Option<String>,
}

impl EnvOverrides {
    /// Read from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let list = |key: &str, sep: char| {
            non_empty(key).map(|v| {
                v.split(sep)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
        };

        EnvOverrides {
            install_root: non_empty(ENV_INSTALL_ROOT),
            compiler: non_empty(ENV_COMPILER),
            library_roots: list(ENV_LIBRARY_ROOTS, ':').unwrap_or_default(),
            disable_version_check: non_empty(ENV_DISABLE_VERSION_CHECK).map(|v| {
                !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off")
            }),
            platforms: list(ENV_PLATFORMS, ','),
            toolchains: list(ENV_TOOLCHAINS, ','),
            log_level: non_empty(ENV_LOG),
        }
    }

    /// Produce the overridden plan. The input plan is left untouched.
    pub fn apply(&self, plan: &MatrixPlan) -> Result<MatrixPlan, ConfigError> {
        let mut plan = plan.clone();
        let mut entries = plan.profile.entries().to_vec();

        if let Some(root) = &self.install_root {
            replace_or_insert(&mut entries, INSTALL_ROOT_VAR, root);
        }
        if let Some(compiler) = &self.compiler {
            replace_or_insert(&mut entries, COMPILER_VAR, compiler);
        }
        for root in &self.library_roots {
            let lib = format!("{}/lib", root.trim_end_matches('/'));
            for var in LIBRARY_PATH_VARS {
                entries.push(EnvEntry::append(var, lib.clone()));
            }
        }
        match self.disable_version_check {
            Some(false) => entries.retain(|e| e.name != VERSION_CHECK_VAR),
            Some(true) if !entries.iter().any(|e| e.name == VERSION_CHECK_VAR) => {
                entries.push(EnvEntry::set(VERSION_CHECK_VAR, "1"));
            }
            _ => {}
        }
        plan.profile = EnvProfile::new(entries);

        if let Some(platforms) = &self.platforms {
            let axis = plan.platform_axis.clone();
            plan.restrict_axis(&axis, platforms)?;
        }
        if let Some(toolchains) = &self.toolchains {
            let axis = plan
                .axes
                .iter()
                .find(|a| a.name != plan.platform_axis)
                .map(|a| a.name.clone())
                .ok_or_else(|| ConfigError::MalformedAxis {
                    axis: ENV_TOOLCHAINS.to_string(),
                    reason: "plan has no toolchain axis to select from".to_string(),
                })?;
            plan.restrict_axis(&axis, toolchains)?;
        }

        Ok(plan)
    }
}

/// Overwrite the first plain assignment of `name`, or define it up front so
/// later entries can reference it.
fn replace_or_insert(entries: &mut Vec<EnvEntry>, name: &str, value: &str) {
    match entries
        .iter_mut()
        .find(|e| e.name == name && e.op == EnvOp::Set)
    {
        Some(entry) => entry.value = value.to_string(),
        None => entries.insert(0, EnvEntry::set(name, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets::preset;
    use std::collections::{BTreeMap, HashMap};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_parses_lists() {
        let o = EnvOverrides::from_lookup(lookup(&[
            (ENV_PLATFORMS, "ubuntu-latest, macos-latest"),
            (ENV_LIBRARY_ROOTS, "/opt/netcdf:/opt/hdf5"),
            (ENV_DISABLE_VERSION_CHECK, "false"),
            (ENV_COMPILER, "  "),
        ]));
        assert_eq!(
            o.platforms,
            Some(vec!["ubuntu-latest".to_string(), "macos-latest".to_string()])
        );
        assert_eq!(o.library_roots, vec!["/opt/netcdf", "/opt/hdf5"]);
        assert_eq!(o.disable_version_check, Some(false));
        assert_eq!(o.compiler, None);
    }

    #[test]
    fn test_apply_profile_overrides() {
        let plan = preset("konrad").unwrap();
        let o = EnvOverrides::from_lookup(lookup(&[
            (ENV_INSTALL_ROOT, "/opt/psrad"),
            (ENV_COMPILER, "clang"),
            (ENV_LIBRARY_ROOTS, "/opt/netcdf/"),
            (ENV_DISABLE_VERSION_CHECK, "0"),
        ]));
        let applied = o.apply(&plan).unwrap();
        let env = applied
            .profile
            .resolve(&BTreeMap::from([("LD_LIBRARY_PATH".to_string(), "/usr/lib".to_string())]))
            .unwrap();

        assert_eq!(env["PSRAD_PATH"], "/opt/psrad");
        assert_eq!(env["CC"], "clang");
        assert_eq!(env["LD_LIBRARY_PATH"], "/usr/lib:/opt/psrad/lib:/opt/netcdf/lib");
        assert!(!env.contains_key(VERSION_CHECK_VAR));
        // original untouched
        assert!(plan.profile.entries().iter().any(|e| e.name == VERSION_CHECK_VAR));
    }

    #[test]
    fn test_apply_axis_selectors() {
        let plan = preset("konrad").unwrap();
        let o = EnvOverrides::from_lookup(lookup(&[
            (ENV_PLATFORMS, "macos-latest"),
            (ENV_TOOLCHAINS, "3.9,3.10"),
        ]));
        let jobs = o.apply(&plan).unwrap().jobs().unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["build (macos-latest, 3.9)", "build (macos-latest, 3.10)"]);
    }

    #[test]
    fn test_unknown_selector_value_is_config_error() {
        let plan = preset("konrad").unwrap();
        let o = EnvOverrides::from_lookup(lookup(&[(ENV_PLATFORMS, "windows-latest")]));
        assert!(matches!(o.apply(&plan), Err(ConfigError::MalformedAxis { .. })));
    }

    #[test]
    fn test_install_root_inserted_when_missing() {
        let plan = preset("smoke").unwrap();
        let o = EnvOverrides::from_lookup(lookup(&[(ENV_INSTALL_ROOT, "/opt/x")]));
        let applied = o.apply(&plan).unwrap();
        assert_eq!(applied.profile.entries()[0], EnvEntry::set(INSTALL_ROOT_VAR, "/opt/x"));
    }
}
