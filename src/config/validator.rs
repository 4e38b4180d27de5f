//! Matrix definition validation.

use crate::error::ConfigError;
use crate::matrix::{axis_variable, MatrixPlan};
use crate::models::{Axis, Step, StepAction};
use crate::profile::EnvProfile;
use std::collections::{BTreeMap, HashSet};
use std::path::Component;

/// Validate a whole plan. Called by `MatrixPlan::jobs()` before expansion.
pub fn validate_plan(plan: &MatrixPlan) -> Result<(), ConfigError> {
    if plan.name.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Matrix name cannot be empty".to_string(),
        ));
    }

    validate_axes(&plan.axes, &plan.platform_axis)?;
    validate_steps(&plan.steps, &plan.actions)?;

    plan.profile.validate().map_err(|e| {
        ConfigError::ValidationFailed(format!("Invalid profile: {}", e))
    })?;

    if plan.job_timeout_secs == Some(0) {
        return Err(ConfigError::ValidationFailed(
            "job_timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

/// Validate axis names and values, and that the platform axis exists.
///
/// An axis with zero values is allowed: it expands to zero jobs.
pub fn validate_axes(axes: &[Axis], platform_axis: &str) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    let mut variables = BTreeMap::new();

    for axis in axes {
        if axis.name.trim().is_empty() {
            return Err(ConfigError::MalformedAxis {
                axis: axis.name.clone(),
                reason: "axis name cannot be empty".to_string(),
            });
        }

        if !names.insert(axis.name.as_str()) {
            return Err(ConfigError::MalformedAxis {
                axis: axis.name.clone(),
                reason: "axis defined more than once".to_string(),
            });
        }

        let variable = axis_variable(&axis.name);
        if let Some(other) = variables.insert(variable.clone(), axis.name.as_str()) {
            return Err(ConfigError::MalformedAxis {
                axis: axis.name.clone(),
                reason: format!("maps to {} like axis '{}'", variable, other),
            });
        }

        let mut values = HashSet::new();
        for value in &axis.values {
            if value.trim().is_empty() {
                return Err(ConfigError::MalformedAxis {
                    axis: axis.name.clone(),
                    reason: "axis values cannot be empty".to_string(),
                });
            }
            if !values.insert(value.as_str()) {
                return Err(ConfigError::MalformedAxis {
                    axis: axis.name.clone(),
                    reason: format!("duplicate value '{}'", value),
                });
            }
        }
    }

    if !axes.is_empty() && !names.contains(platform_axis) {
        return Err(ConfigError::MalformedAxis {
            axis: platform_axis.to_string(),
            reason: "platform axis is not defined".to_string(),
        });
    }

    Ok(())
}

/// Validate the step template against the reusable action table.
pub fn validate_steps(
    steps: &[Step],
    actions: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    if steps.is_empty() {
        return Err(ConfigError::EmptyStepTemplate);
    }

    for (name, body) in actions {
        if body.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "Action '{}' has an empty body",
                name
            )));
        }
    }

    let mut names = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Step name cannot be empty".to_string(),
            ));
        }

        if !names.insert(step.name.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Duplicate step name '{}'",
                step.name
            )));
        }

        match &step.action {
            StepAction::Run(cmd) if cmd.trim().is_empty() => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Step '{}' has an empty `run` command",
                    step.name
                )));
            }
            StepAction::Uses(action) if !actions.contains_key(action) => {
                return Err(ConfigError::UnknownAction {
                    step: step.name.clone(),
                    action: action.clone(),
                });
            }
            _ => {}
        }

        EnvProfile::new(step.env.clone()).validate().map_err(|e| {
            ConfigError::ValidationFailed(format!("Step '{}' env: {}", step.name, e))
        })?;

        if let Some(dir) = &step.working_directory {
            let escapes = dir
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(ConfigError::ValidationFailed(format!(
                    "Step '{}' working_directory must stay inside the job workspace: {}",
                    step.name,
                    dir.display()
                )));
            }
        }

        if step.timeout.map_or(false, |t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Step '{}' timeout must be greater than zero",
                step.name
            )));
        }
    }

    Ok(())
}
