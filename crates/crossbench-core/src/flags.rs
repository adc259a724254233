//! Ordered command-line flag collections with set-once semantics.
//!
//! Browser variants are defined by their flag set, so accidentally
//! overwriting a flag silently would corrupt a benchmark matrix. All
//! mutations go through [`Flags::set_value`] which rejects conflicting
//! values unless an explicit override is requested.

use std::collections::HashSet;
use std::fmt;

use crate::errors::FlagError;

type Result<T> = std::result::Result<T, FlagError>;

/// An ordered, deduplicated mapping from `--name` to an optional value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    entries: Vec<(String, Option<String>)>,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut flags = Self::new();
        for (name, value) in pairs {
            flags.set_value(&name.into(), value.map(Into::into).as_deref())?;
        }
        Ok(flags)
    }

    /// Builds flags from bare names such as `--headless`. Names carrying
    /// an inline `=value` are rejected, use [`Flags::from_pairs`] instead.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut flags = Self::new();
        for name in names {
            let name = name.into();
            if name.contains('=') {
                return Err(FlagError::InlineValue { name });
            }
            flags.set(&name)?;
        }
        Ok(flags)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref())
    }

    /// Sets a value-less flag.
    pub fn set(&mut self, name: &str) -> Result<()> {
        self.set_value(name, None)
    }

    /// Sets a flag. Re-setting the identical value is a no-op; changing an
    /// existing value fails unless `override` semantics are requested via
    /// [`Flags::set_value_override`].
    pub fn set_value(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.insert(name, value, false)
    }

    pub fn set_value_override(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.insert(name, value, true)
    }

    fn insert(&mut self, name: &str, value: Option<&str>, override_existing: bool) -> Result<()> {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(n, _)| n == name) {
            if existing.as_deref() == value {
                return Ok(());
            }
            if !override_existing {
                return Err(FlagError::Conflict {
                    name: name.to_string(),
                    existing: existing.clone(),
                    new: value.map(str::to_string),
                });
            }
            *existing = value.map(str::to_string);
            return Ok(());
        }
        self.entries
            .push((name.to_string(), value.map(str::to_string)));
        Ok(())
    }

    pub fn update(&mut self, other: &Flags) -> Result<()> {
        for (name, value) in &other.entries {
            self.set_value(name, value.as_deref())?;
        }
        Ok(())
    }

    pub fn update_override(&mut self, other: &Flags) -> Result<()> {
        for (name, value) in &other.entries {
            self.set_value_override(name, value.as_deref())?;
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    /// Renders the flags as argv entries: `--foo=v1`, `--bar`.
    pub fn to_list(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, value)| match value {
                Some(value) => format!("{name}={value}"),
                None => name.clone(),
            })
            .collect()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_list().join(" "))
    }
}

/// V8-style flags where `--foo` and `--no-foo` / `--nofoo` are mutually
/// exclusive spellings of the same switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsFlags {
    flags: Flags,
}

impl JsFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma-separated `--js-flags` payload.
    pub fn parse(data: &str) -> Result<Self> {
        let mut flags = Self::new();
        for part in data.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => flags.set_value(name, Some(value))?,
                None => flags.set(part)?,
            }
        }
        Ok(flags)
    }

    fn counterparts(name: &str) -> Vec<String> {
        if let Some(suffix) = name.strip_prefix("--no-") {
            vec![format!("--{suffix}")]
        } else if let Some(suffix) = name.strip_prefix("--no") {
            vec![format!("--{suffix}")]
        } else if let Some(suffix) = name.strip_prefix("--") {
            vec![format!("--no-{suffix}"), format!("--no{suffix}")]
        } else {
            Vec::new()
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.flags.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn set(&mut self, name: &str) -> Result<()> {
        self.set_value(name, None)
    }

    pub fn set_value(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.check_conflict(name)?;
        self.flags.set_value(name, value)
    }

    /// Override semantics drop the conflicting negated/plain counterpart.
    pub fn set_value_override(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        for counterpart in Self::counterparts(name) {
            self.flags.remove(&counterpart);
        }
        self.flags.set_value_override(name, value)
    }

    fn check_conflict(&self, name: &str) -> Result<()> {
        for counterpart in Self::counterparts(name) {
            if self.flags.contains(&counterpart) {
                return Err(FlagError::NegatedPair {
                    name: name.to_string(),
                    counterpart,
                });
            }
        }
        Ok(())
    }

    pub fn update(&mut self, other: &JsFlags) -> Result<()> {
        for (name, value) in other.flags.iter() {
            self.set_value(name, value)?;
        }
        Ok(())
    }

    pub fn to_list(&self) -> Vec<String> {
        self.flags.to_list()
    }
}

impl fmt::Display for JsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_list().join(","))
    }
}

/// `--enable-features` / `--disable-features` bookkeeping. A feature can
/// appear on at most one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChromeFeatures {
    enabled: Vec<String>,
    disabled: Vec<String>,
}

impl ChromeFeatures {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty() && self.disabled.is_empty()
    }

    pub fn enabled(&self) -> &[String] {
        &self.enabled
    }

    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    pub fn enable_all(&mut self, features: &str) -> Result<()> {
        for feature in Self::split(features) {
            if self.disabled.iter().any(|f| f == &feature) {
                return Err(FlagError::FeatureConflict { feature });
            }
            if !self.enabled.contains(&feature) {
                self.enabled.push(feature);
            }
        }
        Ok(())
    }

    pub fn disable_all(&mut self, features: &str) -> Result<()> {
        for feature in Self::split(features) {
            if self.enabled.iter().any(|f| f == &feature) {
                return Err(FlagError::FeatureConflict { feature });
            }
            if !self.disabled.contains(&feature) {
                self.disabled.push(feature);
            }
        }
        Ok(())
    }

    fn split(features: &str) -> Vec<String> {
        features
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Chromium flag set. Recognizes the nested `--js-flags` payload and the
/// feature toggle switches; everything else behaves like plain [`Flags`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChromeFlags {
    flags: Flags,
    js_flags: JsFlags,
    features: ChromeFeatures,
}

const JS_FLAGS: &str = "--js-flags";
const ENABLE_FEATURES: &str = "--enable-features";
const DISABLE_FEATURES: &str = "--disable-features";

impl ChromeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut flags = Self::new();
        for (name, value) in pairs {
            flags.set_value(&name.into(), value.map(Into::into).as_deref())?;
        }
        Ok(flags)
    }

    pub fn contains(&self, name: &str) -> bool {
        match name {
            JS_FLAGS => !self.js_flags.is_empty(),
            _ => self.flags.contains(name),
        }
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.flags.get(name)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
            + usize::from(!self.js_flags.is_empty())
            + usize::from(!self.features.enabled.is_empty())
            + usize::from(!self.features.disabled.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn js_flags(&self) -> &JsFlags {
        &self.js_flags
    }

    pub fn js_flags_mut(&mut self) -> &mut JsFlags {
        &mut self.js_flags
    }

    pub fn features(&self) -> &ChromeFeatures {
        &self.features
    }

    pub fn set(&mut self, name: &str) -> Result<()> {
        self.set_value(name, None)
    }

    pub fn set_value(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        match name {
            JS_FLAGS => {
                let value = value.ok_or_else(|| FlagError::MissingValue {
                    name: name.to_string(),
                })?;
                self.js_flags.update(&JsFlags::parse(value)?)
            }
            ENABLE_FEATURES => {
                let value = value.ok_or_else(|| FlagError::MissingValue {
                    name: name.to_string(),
                })?;
                self.features.enable_all(value)
            }
            DISABLE_FEATURES => {
                let value = value.ok_or_else(|| FlagError::MissingValue {
                    name: name.to_string(),
                })?;
                self.features.disable_all(value)
            }
            _ => self.flags.set_value(name, value),
        }
    }

    pub fn set_value_override(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        match name {
            JS_FLAGS | ENABLE_FEATURES | DISABLE_FEATURES => self.set_value(name, value),
            _ => self.flags.set_value_override(name, value),
        }
    }

    pub fn update(&mut self, other: &Flags) -> Result<()> {
        for (name, value) in other.iter() {
            self.set_value(name, value)?;
        }
        Ok(())
    }

    /// Renders the complete argv, folding the nested JS flags and feature
    /// lists back into their carrier switches.
    pub fn to_list(&self) -> Vec<String> {
        let mut list = self.flags.to_list();
        if !self.features.enabled.is_empty() {
            list.push(format!("{ENABLE_FEATURES}={}", self.features.enabled.join(",")));
        }
        if !self.features.disabled.is_empty() {
            list.push(format!(
                "{DISABLE_FEATURES}={}",
                self.features.disabled.join(",")
            ));
        }
        if !self.js_flags.is_empty() {
            list.push(format!("{JS_FLAGS}={}", self.js_flags));
        }
        list
    }
}

impl fmt::Display for ChromeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_list().join(" "))
    }
}

/// Checks that the rendered flag list has no duplicate switch names.
pub fn assert_no_duplicates<'a>(args: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for arg in args {
        let name = arg.split('=').next().unwrap_or(arg);
        if !seen.insert(name.to_string()) {
            return Err(FlagError::Duplicate {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flags() {
        let flags = Flags::new();
        assert_eq!(flags.len(), 0);
        assert!(!flags.contains("--foo"));
    }

    #[test]
    fn from_pairs_keeps_order() {
        let flags =
            Flags::from_pairs([("--foo", Some("v1")), ("--bar", None::<&str>)]).unwrap();
        assert_eq!(flags.get("--foo"), Some(Some("v1")));
        assert_eq!(flags.get("--bar"), Some(None));
        assert_eq!(flags.to_list(), vec!["--foo=v1", "--bar"]);
    }

    #[test]
    fn from_names_rejects_inline_values() {
        assert!(Flags::from_names(["--foo=v1"]).is_err());
        let flags = Flags::from_names(["--foo", "--bar"]).unwrap();
        assert_eq!(flags.get("--foo"), Some(None));
    }

    #[test]
    fn set_once_semantics() {
        let mut flags = Flags::new();
        flags.set_value("--foo", Some("v1")).unwrap();
        assert!(flags.set_value("--foo", Some("v2")).is_err());
        // Re-setting the same value is fine.
        flags.set_value("--foo", Some("v1")).unwrap();
        flags.set("--bar").unwrap();
        assert!(flags.set_value("--bar", Some("v3")).is_err());
        flags.set_value_override("--bar", Some("v4")).unwrap();
        assert_eq!(flags.get("--foo"), Some(Some("v1")));
        assert_eq!(flags.get("--bar"), Some(Some("v4")));
    }

    #[test]
    fn update_requires_override_for_changes() {
        let mut flags =
            Flags::from_pairs([("--foo", Some("v1")), ("--bar", None::<&str>)]).unwrap();
        let other = Flags::from_pairs([("--bar", Some("v2"))]).unwrap();
        assert!(flags.update(&other).is_err());
        assert_eq!(flags.get("--bar"), Some(None));
        flags.update_override(&other).unwrap();
        assert_eq!(flags.get("--bar"), Some(Some("v2")));
    }

    #[test]
    fn js_flags_reject_negated_pairs() {
        assert!(JsFlags::parse("--foo,--no-foo").is_err());
        assert!(JsFlags::parse("--foo,--nofoo").is_err());
        let flags = JsFlags::parse("--foo,--no-bar").unwrap();
        assert_eq!(flags.get("--foo"), Some(None));
        assert_eq!(flags.get("--no-bar"), Some(None));
        assert!(!flags.contains("--no-foo"));
        assert!(!flags.contains("--bar"));
    }

    #[test]
    fn js_flags_override_drops_counterpart() {
        let mut flags = JsFlags::parse("--foo,--no-bar").unwrap();
        assert!(flags.set("--no-foo").is_err());
        // Alternate negative spelling of --no-bar, not a conflict.
        flags.set("--nobar").unwrap();
        assert!(flags.set("--bar").is_err());
        flags.set_value_override("--no-foo", None).unwrap();
        assert!(!flags.contains("--foo"));
        assert!(flags.contains("--no-foo"));
    }

    #[test]
    fn chrome_flags_nested_js_flags() {
        let mut flags = ChromeFlags::new();
        flags.set_value("--bar", Some("v1")).unwrap();
        assert!(!flags.contains("--js-flags"));
        assert!(flags
            .set_value("--js-flags", Some("--js-foo,--no-js-foo"))
            .is_err());
        flags
            .set_value("--js-flags", Some("--js-foo=v3,--no-js-bar"))
            .unwrap();
        assert!(flags
            .set_value("--js-flags", Some("--js-foo=v4,--no-js-bar"))
            .is_err());
        assert_eq!(flags.js_flags().get("--js-foo"), Some(Some("v3")));
        assert_eq!(flags.js_flags().get("--no-js-bar"), Some(None));
    }

    #[test]
    fn chrome_flags_features() {
        let mut flags = ChromeFlags::new();
        assert!(flags.features().is_empty());
        flags.set_value("--enable-features", Some("F1,F2")).unwrap();
        assert!(flags.set_value("--disable-features", Some("F1,F2")).is_err());
        assert!(flags.set_value("--disable-features", Some("F2,F1")).is_err());
        flags.set_value("--disable-features", Some("F3,F4")).unwrap();
        assert_eq!(flags.features().enabled(), ["F1", "F2"]);
        assert_eq!(flags.features().disabled(), ["F3", "F4"]);
    }

    #[test]
    fn chrome_flags_render_argv() {
        let mut flags = ChromeFlags::new();
        flags.set("--headless").unwrap();
        flags.set_value("--js-flags", Some("--foo=v1,--no-bar")).unwrap();
        flags.set_value("--enable-features", Some("F1")).unwrap();
        let list = flags.to_list();
        assert!(list.contains(&"--headless".to_string()));
        assert!(list.contains(&"--enable-features=F1".to_string()));
        assert!(list.contains(&"--js-flags=--foo=v1,--no-bar".to_string()));
        assert_no_duplicates(list.iter().map(String::as_str)).unwrap();
    }
}
