//! Environment profiles for job execution.
//!
//! A profile is an ordered list of variable assignments applied on top of an
//! explicit base environment. Order matters: a value may reference any
//! variable defined before it with `${NAME}`, and search-path style entries
//! accumulate onto the previous value instead of replacing it.
//!
//! ```text
//! PSRAD_PATH      = ${HOME}/psrad
//! LD_LIBRARY_PATH += ${PSRAD_PATH}/lib      (append, ':' separated)
//! ```
//!
//! Profiles are never mutated once built. Layering step-specific entries on
//! top of a job profile produces a new profile via [`EnvProfile::with_entries`].

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

static VAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// How an entry combines with the value already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvOp {
    /// Replace any previous value
    #[default]
    Set,
    /// `previous + separator + value`
    Append,
    /// `value + separator + previous`
    Prepend,
}

fn default_separator() -> String {
    ":".to_string()
}

fn is_default_separator(sep: &String) -> bool {
    sep == ":"
}

/// A single `(name, value template)` assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub op: EnvOp,
    #[serde(default = "default_separator", skip_serializing_if = "is_default_separator")]
    pub separator: String,
}

impl EnvEntry {
    /// Plain assignment.
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvEntry {
            name: name.into(),
            value: value.into(),
            op: EnvOp::Set,
            separator: default_separator(),
        }
    }

    /// Append to a `:`-separated search path.
    pub fn append(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvEntry {
            op: EnvOp::Append,
            ..EnvEntry::set(name, value)
        }
    }

    /// Prepend to a `:`-separated search path.
    pub fn prepend(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvEntry {
            op: EnvOp::Prepend,
            ..EnvEntry::set(name, value)
        }
    }

    /// Use a custom separator for append/prepend.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

/// Ordered, immutable list of environment assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvProfile {
    entries: Vec<EnvEntry>,
}

impl EnvProfile {
    pub fn new(entries: Vec<EnvEntry>) -> Self {
        EnvProfile { entries }
    }

    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// New profile with `extra` applied after this profile's entries.
    pub fn with_entries(&self, extra: &[EnvEntry]) -> EnvProfile {
        let mut entries = self.entries.clone();
        entries.extend_from_slice(extra);
        EnvProfile { entries }
    }

    /// Check every name and every `${...}` reference is well formed.
    pub fn validate(&self) -> Result<(), ProfileError> {
        for entry in &self.entries {
            if !VAR_NAME.is_match(&entry.name) {
                return Err(ProfileError::InvalidName(entry.name.clone()));
            }
            interpolate(&entry.name, &entry.value, &BTreeMap::new(), false)?;
        }
        Ok(())
    }

    /// Apply the profile over `base`. Undefined references expand to "".
    pub fn resolve(
        &self,
        base: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        self.apply(base, false)
    }

    /// Apply the profile over `base`, failing on undefined references.
    pub fn resolve_strict(
        &self,
        base: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        self.apply(base, true)
    }

    fn apply(
        &self,
        base: &BTreeMap<String, String>,
        strict: bool,
    ) -> Result<BTreeMap<String, String>, ProfileError> {
        let mut env = base.clone();
        for entry in &self.entries {
            if !VAR_NAME.is_match(&entry.name) {
                return Err(ProfileError::InvalidName(entry.name.clone()));
            }
            let value = interpolate(&entry.name, &entry.value, &env, strict)?;
            let combined = match (entry.op, env.get(&entry.name)) {
                (EnvOp::Set, _) => value,
                (EnvOp::Append, Some(prev)) if !prev.is_empty() => {
                    format!("{}{}{}", prev, entry.separator, value)
                }
                (EnvOp::Prepend, Some(prev)) if !prev.is_empty() => {
                    format!("{}{}{}", value, entry.separator, prev)
                }
                (EnvOp::Append | EnvOp::Prepend, _) => value,
            };
            env.insert(entry.name.clone(), combined);
        }
        Ok(env)
    }
}

impl FromIterator<EnvEntry> for EnvProfile {
    fn from_iter<I: IntoIterator<Item = EnvEntry>>(iter: I) -> Self {
        EnvProfile {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Expand `${NAME}` references in `template` against `env`.
///
/// `$$` yields a literal `$`; a `$` not followed by `{` or `$` is kept as-is.
fn interpolate(
    entry: &str,
    template: &str,
    env: &BTreeMap<String, String>,
    strict: bool,
) -> Result<String, ProfileError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| ProfileError::Unterminated(entry.to_string()))?;
            let name = &body[..end];
            if !VAR_NAME.is_match(name) {
                return Err(ProfileError::InvalidName(name.to_string()));
            }
            match env.get(name) {
                Some(value) => out.push_str(value),
                None if strict => {
                    return Err(ProfileError::UndefinedVariable {
                        entry: entry.to_string(),
                        reference: name.to_string(),
                    })
                }
                None => {}
            }
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sequential_interpolation() {
        let profile = EnvProfile::new(vec![EnvEntry::set("A", "1"), EnvEntry::set("B", "${A}-2")]);
        let env = profile.resolve(&BTreeMap::new()).unwrap();
        assert_eq!(env["B"], "1-2");
    }

    #[test]
    fn test_later_entry_does_not_affect_earlier() {
        let profile = EnvProfile::new(vec![
            EnvEntry::set("B", "${A}-2"),
            EnvEntry::set("A", "1"),
        ]);
        let env = profile.resolve(&BTreeMap::new()).unwrap();
        assert_eq!(env["B"], "-2");
        assert_eq!(env["A"], "1");
    }

    #[test]
    fn test_append_accumulates_search_path() {
        let profile = EnvProfile::new(vec![
            EnvEntry::set("ROOT", "/opt/psrad"),
            EnvEntry::append("LD_LIBRARY_PATH", "${ROOT}/lib"),
            EnvEntry::append("LD_LIBRARY_PATH", "/opt/netcdf/lib"),
        ]);
        let env = profile
            .resolve(&base(&[("LD_LIBRARY_PATH", "/usr/lib")]))
            .unwrap();
        assert_eq!(env["LD_LIBRARY_PATH"], "/usr/lib:/opt/psrad/lib:/opt/netcdf/lib");
    }

    #[test]
    fn test_append_to_missing_has_no_leading_separator() {
        let profile = EnvProfile::new(vec![EnvEntry::append("LD_LIBRARY_PATH", "/a")]);
        let env = profile.resolve(&BTreeMap::new()).unwrap();
        assert_eq!(env["LD_LIBRARY_PATH"], "/a");
    }

    #[test]
    fn test_prepend_with_custom_separator() {
        let profile = EnvProfile::new(vec![EnvEntry::prepend("FLAGS", "-O2").with_separator(" ")]);
        let env = profile.resolve(&base(&[("FLAGS", "-g")])).unwrap();
        assert_eq!(env["FLAGS"], "-O2 -g");
    }

    #[test]
    fn test_base_environment_visible_and_untouched() {
        let b = base(&[("HOME", "/home/ci")]);
        let profile = EnvProfile::new(vec![EnvEntry::set("PSRAD_PATH", "${HOME}/psrad")]);
        let env = profile.resolve(&b).unwrap();
        assert_eq!(env["PSRAD_PATH"], "/home/ci/psrad");
        assert!(!b.contains_key("PSRAD_PATH"));
    }

    #[test]
    fn test_strict_rejects_undefined() {
        let profile = EnvProfile::new(vec![EnvEntry::set("B", "${MISSING}")]);
        assert_eq!(profile.resolve(&BTreeMap::new()).unwrap()["B"], "");
        assert_eq!(
            profile.resolve_strict(&BTreeMap::new()),
            Err(ProfileError::UndefinedVariable {
                entry: "B".to_string(),
                reference: "MISSING".to_string()
            })
        );
    }

    #[test]
    fn test_dollar_escapes() {
        let profile = EnvProfile::new(vec![EnvEntry::set("P", "$$HOME and $1")]);
        let env = profile.resolve(&BTreeMap::new()).unwrap();
        assert_eq!(env["P"], "$HOME and $1");
    }

    #[test]
    fn test_validate_catches_bad_input() {
        let unterminated = EnvProfile::new(vec![EnvEntry::set("A", "${B")]);
        assert_eq!(
            unterminated.validate(),
            Err(ProfileError::Unterminated("A".to_string()))
        );

        let bad_name = EnvProfile::new(vec![EnvEntry::set("1A", "x")]);
        assert!(matches!(bad_name.validate(), Err(ProfileError::InvalidName(_))));
    }

    #[test]
    fn test_with_entries_leaves_original() {
        let profile = EnvProfile::new(vec![EnvEntry::set("A", "1")]);
        let extended = profile.with_entries(&[EnvEntry::set("B", "2")]);
        assert_eq!(profile.len(), 1);
        assert_eq!(extended.len(), 2);
    }

    #[test]
    fn test_toml_round_trip_keeps_order() {
        #[derive(Deserialize)]
        struct Doc {
            profile: EnvProfile,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[profile]]
            name = "A"
            value = "1"

            [[profile]]
            name = "PATH"
            value = "${A}/bin"
            op = "prepend"
            "#,
        )
        .unwrap();
        assert_eq!(doc.profile.entries()[0].name, "A");
        assert_eq!(doc.profile.entries()[1].op, EnvOp::Prepend);
        assert_eq!(doc.profile.entries()[1].separator, ":");
    }
}
