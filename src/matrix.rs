//! Matrix expansion: axes × step template -> jobs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::validator;
use crate::error::ConfigError;
use crate::models::{Axis, Job, Step};
use crate::profile::{EnvEntry, EnvProfile};

/// One combination of axis values, `(axis, value)` in axis order.
pub type Combination = Vec<(String, String)>;

fn default_platform_axis() -> String {
    "os".to_string()
}

/// A complete build/test matrix definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixPlan {
    /// Prefix of every job identifier
    pub name: String,
    /// Axis whose value selects the job's platform
    #[serde(default = "default_platform_axis")]
    pub platform_axis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    pub axes: Vec<Axis>,
    /// Applied to every job after the `MATRIX_<AXIS>` entries
    #[serde(default, skip_serializing_if = "EnvProfile::is_empty")]
    pub profile: EnvProfile,
    /// Reusable action bodies referenced by `uses`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

/// Cross product of axis values, first axis varying slowest.
///
/// An axis with no values yields no combinations; no axes at all yields a
/// single empty combination.
pub fn expand(axes: &[Axis]) -> Vec<Combination> {
    let mut combos: Vec<Combination> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(combos.len() * axis.values.len());
        for prefix in &combos {
            for value in &axis.values {
                let mut combo = prefix.clone();
                combo.push((axis.name.clone(), value.clone()));
                next.push(combo);
            }
        }
        combos = next;
    }
    combos
}

/// `MATRIX_<AXIS>` variable name for an axis.
pub fn axis_variable(axis: &str) -> String {
    let upper: String = axis
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("MATRIX_{}", upper)
}

impl MatrixPlan {
    /// Validate the plan and materialize every job.
    ///
    /// Configuration errors are reported here, before anything runs.
    pub fn jobs(&self) -> Result<Vec<Job>, ConfigError> {
        validator::validate_plan(self)?;

        let steps: Arc<[Step]> = Arc::from(self.steps.clone());
        let actions = Arc::new(self.actions.clone());
        let timeout = self.job_timeout_secs.map(Duration::from_secs);

        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for (index, values) in expand(&self.axes).into_iter().enumerate() {
            let id = self.job_id(&values);
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateJob(id));
            }

            let platform = values
                .iter()
                .find(|(axis, _)| *axis == self.platform_axis)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| std::env::consts::OS.to_string());

            let profile: EnvProfile = values
                .iter()
                .map(|(axis, value)| EnvEntry::set(axis_variable(axis), value.clone()))
                .chain(self.profile.entries().iter().cloned())
                .collect();

            jobs.push(Job {
                id,
                index,
                values,
                platform,
                profile,
                steps: Arc::clone(&steps),
                actions: Arc::clone(&actions),
                timeout,
            });
        }

        log::debug!("Expanded matrix '{}' into {} jobs", self.name, jobs.len());
        Ok(jobs)
    }

    fn job_id(&self, values: &Combination) -> String {
        if values.is_empty() {
            return self.name.clone();
        }
        let parts: Vec<&str> = values.iter().map(|(_, v)| v.as_str()).collect();
        format!("{} ({})", self.name, parts.join(", "))
    }

    /// Keep only `selected` values of `axis`, preserving plan order.
    pub fn restrict_axis(&mut self, axis: &str, selected: &[String]) -> Result<(), ConfigError> {
        let target = self
            .axes
            .iter_mut()
            .find(|a| a.name == axis)
            .ok_or_else(|| ConfigError::MalformedAxis {
                axis: axis.to_string(),
                reason: "selector names an axis that does not exist".to_string(),
            })?;

        if let Some(unknown) = selected.iter().find(|s| !target.values.contains(s)) {
            return Err(ConfigError::MalformedAxis {
                axis: axis.to_string(),
                reason: format!("selected value '{}' is not one of {:?}", unknown, target.values),
            });
        }
        target.values.retain(|v| selected.contains(v));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(axes: Vec<Axis>) -> MatrixPlan {
        MatrixPlan {
            name: "build".to_string(),
            platform_axis: "os".to_string(),
            job_timeout_secs: None,
            axes,
            profile: EnvProfile::new(vec![EnvEntry::set("TAG", "${MATRIX_OS}-${MATRIX_PYTHON}")]),
            actions: BTreeMap::new(),
            steps: vec![Step::run("test", "true")],
        }
    }

    #[test]
    fn test_expand_first_axis_slowest() {
        let combos = expand(&[Axis::new("os", ["linux", "mac"]), Axis::new("py", ["3.8", "3.9"])]);
        let flat: Vec<Vec<&str>> = combos
            .iter()
            .map(|c| c.iter().map(|(_, v)| v.as_str()).collect())
            .collect();
        assert_eq!(
            flat,
            vec![
                vec!["linux", "3.8"],
                vec!["linux", "3.9"],
                vec!["mac", "3.8"],
                vec!["mac", "3.9"]
            ]
        );
    }

    #[test]
    fn test_expand_empty_axis_yields_nothing() {
        let empty: Vec<String> = Vec::new();
        let combos = expand(&[Axis::new("os", ["linux"]), Axis::new("py", empty)]);
        assert!(combos.is_empty());
    }

    #[test]
    fn test_expand_no_axes_yields_one() {
        assert_eq!(expand(&[]), vec![Vec::new()]);
    }

    #[test]
    fn test_jobs_carry_platform_and_profile() {
        let plan = plan(vec![
            Axis::new("os", ["ubuntu-latest", "macos-latest"]),
            Axis::new("python", ["3.9"]),
        ]);
        let jobs = plan.jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "build (ubuntu-latest, 3.9)");
        assert_eq!(jobs[1].platform, "macos-latest");
        assert_eq!(jobs[1].index, 1);

        let env = jobs[1].profile.resolve(&BTreeMap::new()).unwrap();
        assert_eq!(env["MATRIX_OS"], "macos-latest");
        assert_eq!(env["TAG"], "macos-latest-3.9");
    }

    #[test]
    fn test_jobs_with_empty_axis_is_not_an_error() {
        let empty: Vec<String> = Vec::new();
        let plan = plan(vec![Axis::new("os", ["ubuntu-latest"]), Axis::new("python", empty)]);
        assert!(plan.jobs().unwrap().is_empty());
    }

    #[test]
    fn test_restrict_axis() {
        let mut plan = plan(vec![Axis::new("os", ["ubuntu-latest", "macos-latest", "windows-latest"])]);
        plan.restrict_axis("os", &["windows-latest".to_string(), "ubuntu-latest".to_string()])
            .unwrap();
        assert_eq!(plan.axes[0].values, vec!["ubuntu-latest", "windows-latest"]);

        let err = plan.restrict_axis("os", &["beos".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAxis { .. }));
        assert!(plan.restrict_axis("arch", &[]).is_err());
    }

    #[test]
    fn test_axis_variable() {
        assert_eq!(axis_variable("python-version"), "MATRIX_PYTHON_VERSION");
        assert_eq!(axis_variable("os"), "MATRIX_OS");
    }
}
