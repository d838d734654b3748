//! Option chooser published through the table.
//!
//! A chooser is a small record dashboards render as a dropdown: the
//! option list, the default, and the currently `active` option, plus a
//! writable `selected` entry. The daemon owns `active`; dashboards write
//! `selected` and the owning worker applies the write on its next tick,
//! snapping invalid selections back.

use anyhow::{bail, Result};
use log::warn;
use serde_json::Value;

use crate::table::Table;

pub const CHOOSER_TYPE: &str = "String Chooser";

#[derive(Debug)]
pub struct Chooser {
    table: Table,
    options: Vec<String>,
    active: String,
    selected_key: String,
}

impl Chooser {
    /// Publishes the chooser record under `table` and starts watching its
    /// `selected` entry.
    pub fn new(table: Table, name: &str, options: Vec<String>, default: &str) -> Result<Chooser> {
        if !options.iter().any(|o| o == default) {
            bail!("chooser '{name}' default '{default}' is not an option");
        }
        table.put(".type", CHOOSER_TYPE)?;
        table.put(".name", name)?;
        table.put("options", options.clone())?;
        table.put("default", default)?;
        table.put("active", default)?;
        table.put("selected", default)?;
        table.watch("selected")?;
        Ok(Chooser {
            selected_key: table.key("selected"),
            table,
            options,
            active: default.to_string(),
        })
    }

    pub fn active(&self) -> &str {
        &self.active
    }

    /// Whether an external write at `path` belongs to this chooser.
    pub fn owns(&self, path: &str) -> bool {
        path == self.selected_key
    }

    /// Applies an external write to `selected`. Returns `true` when the
    /// active option changed; unknown or malformed selections are snapped
    /// back to the current active option.
    pub fn apply_write(&mut self, value: &Value) -> Result<bool> {
        let Some(requested) = value.as_str() else {
            warn!(
                "{}: non-string selection {value}, keeping '{}'",
                self.table.path(),
                self.active
            );
            self.table.put("selected", self.active.as_str())?;
            return Ok(false);
        };
        if requested == self.active {
            return Ok(false);
        }
        if self.options.iter().any(|o| o == requested) {
            self.active = requested.to_string();
            self.table.put("active", requested)?;
            Ok(true)
        } else {
            warn!(
                "{}: unknown option '{requested}', keeping '{}'",
                self.table.path(),
                self.active
            );
            self.table.put("selected", self.active.as_str())?;
            self.table.put("active", self.active.as_str())?;
            Ok(false)
        }
    }

    /// Programmatic switch, publishing both `selected` and `active`.
    pub fn set_active(&mut self, option: &str) -> Result<()> {
        if !self.options.iter().any(|o| o == option) {
            bail!(
                "{}: cannot activate unknown option '{option}'",
                self.table.path()
            );
        }
        self.active = option.to_string();
        self.table.put("selected", option)?;
        self.table.put("active", option)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{KvBackend, MemoryBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn chooser(backend: &Arc<MemoryBackend>) -> Chooser {
        let root = Table::root(Arc::clone(backend) as Arc<dyn KvBackend>, "facet");
        let table = root.child("cameras").child("video0").child("mode");
        Chooser::new(
            table,
            "mode",
            vec![
                "setup".to_string(),
                "focus".to_string(),
                "calibration".to_string(),
            ],
            "setup",
        )
        .unwrap()
    }

    #[test]
    fn publishes_the_full_record() {
        let backend = Arc::new(MemoryBackend::new());
        let c = chooser(&backend);
        let base = "facet/cameras/video0/mode";
        assert_eq!(backend.get(&format!("{base}/.type")), Some(json!(CHOOSER_TYPE)));
        assert_eq!(
            backend.get(&format!("{base}/options")),
            Some(json!(["setup", "focus", "calibration"]))
        );
        assert_eq!(backend.get(&format!("{base}/default")), Some(json!("setup")));
        assert_eq!(backend.get(&format!("{base}/active")), Some(json!("setup")));
        assert!(c.owns(&format!("{base}/selected")));
    }

    #[test]
    fn valid_selection_switches_active() {
        let backend = Arc::new(MemoryBackend::new());
        let mut c = chooser(&backend);
        assert!(c.apply_write(&json!("focus")).unwrap());
        assert_eq!(c.active(), "focus");
        assert_eq!(
            backend.get("facet/cameras/video0/mode/active"),
            Some(json!("focus"))
        );
    }

    #[test]
    fn unknown_selection_snaps_back() {
        let backend = Arc::new(MemoryBackend::new());
        let mut c = chooser(&backend);
        assert!(!c.apply_write(&json!("turbo")).unwrap());
        assert_eq!(c.active(), "setup");
        assert_eq!(
            backend.get("facet/cameras/video0/mode/selected"),
            Some(json!("setup"))
        );
    }

    #[test]
    fn echo_of_the_active_option_is_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let mut c = chooser(&backend);
        assert!(!c.apply_write(&json!("setup")).unwrap());
    }

    #[test]
    fn non_string_selection_snaps_back() {
        let backend = Arc::new(MemoryBackend::new());
        let mut c = chooser(&backend);
        assert!(!c.apply_write(&json!(3)).unwrap());
        assert_eq!(c.active(), "setup");
    }

    #[test]
    fn default_must_be_an_option() {
        let backend = Arc::new(MemoryBackend::new());
        let root = Table::root(backend as Arc<dyn KvBackend>, "facet");
        let err = Chooser::new(root.child("x"), "x", vec!["a".to_string()], "b").unwrap_err();
        assert!(err.to_string().contains("not an option"));
    }

    #[test]
    fn set_active_rejects_unknown_options() {
        let backend = Arc::new(MemoryBackend::new());
        let mut c = chooser(&backend);
        assert!(c.set_active("calibration").is_ok());
        assert!(c.set_active("nope").is_err());
        assert_eq!(c.active(), "calibration");
    }
}
