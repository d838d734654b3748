//! Device control bindings.
//!
//! Each adjustable device control becomes a writable table entry plus a
//! `.metadata/<name>` record (kind, range, step, default) dashboards use
//! to build the matching widget. Writes are snapped onto the control's
//! legal grid before they reach the driver, and the applied value is
//! published back so the dashboard always reflects reality.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::warn;
use serde_json::Value;

use crate::device::CameraDevice;
use crate::table::Table;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    Boolean,
    Integer,
    Menu,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Boolean => "boolean",
            ControlKind::Integer => "integer",
            ControlKind::Menu => "menu",
        }
    }
}

impl FromStr for ControlKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "boolean" => Ok(ControlKind::Boolean),
            "integer" => Ok(ControlKind::Integer),
            "menu" => Ok(ControlKind::Menu),
            other => Err(anyhow!("unrecognized control kind '{other}'")),
        }
    }
}

/// Description of one device control.
#[derive(Clone, Debug)]
pub struct ControlDesc {
    /// Driver-native identifier.
    pub id: u32,
    /// Table entry name.
    pub name: String,
    pub kind: ControlKind,
    pub minimum: i64,
    pub maximum: i64,
    pub step: i64,
    pub default: i64,
    /// Option labels, menu controls only.
    pub menu_items: Vec<String>,
}

impl ControlDesc {
    pub fn boolean(id: u32, name: &str, default: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: ControlKind::Boolean,
            minimum: 0,
            maximum: 1,
            step: 1,
            default: default as i64,
            menu_items: Vec::new(),
        }
    }

    pub fn integer(
        id: u32,
        name: &str,
        minimum: i64,
        maximum: i64,
        step: i64,
        default: i64,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: ControlKind::Integer,
            minimum,
            maximum,
            step,
            default,
            menu_items: Vec::new(),
        }
    }

    pub fn menu(id: u32, name: &str, items: Vec<String>, default: i64) -> Self {
        let maximum = items.len().saturating_sub(1) as i64;
        Self {
            id,
            name: name.to_string(),
            kind: ControlKind::Menu,
            minimum: 0,
            maximum,
            step: 1,
            default,
            menu_items: items,
        }
    }

    /// Snaps `value` onto the control's legal grid: clamped to the range
    /// and a whole number of steps above the minimum.
    pub fn fix_value(&self, value: i64) -> i64 {
        if value <= self.minimum {
            return self.minimum;
        }
        if value >= self.maximum {
            return self.maximum;
        }
        let step = self.step.max(1);
        let steps = (value - self.minimum + step / 2) / step;
        (self.minimum + steps * step).min(self.maximum)
    }
}

struct BoundControl {
    desc: ControlDesc,
    key: String,
}

/// Table bindings for one device's control set.
pub struct ControlBindings {
    table: Table,
    bound: Vec<BoundControl>,
}

impl ControlBindings {
    /// Publishes metadata and current values for every control the device
    /// reports and starts watching the writable entries. Controls whose
    /// current value cannot be read are skipped.
    pub fn publish(table: Table, device: &mut dyn CameraDevice) -> Result<ControlBindings> {
        let mut bound = Vec::new();
        for desc in device.controls()? {
            let value = match device.control_value(desc.id) {
                Ok(value) => value,
                Err(err) => {
                    warn!("skipping control '{}': {err:#}", desc.name);
                    continue;
                }
            };
            let meta = table.child(".metadata").child(&desc.name);
            meta.put("kind", desc.kind.as_str())?;
            meta.put("minimum", desc.minimum)?;
            meta.put("maximum", desc.maximum)?;
            meta.put("step", desc.step)?;
            meta.put("default", desc.default)?;
            if desc.kind == ControlKind::Menu {
                meta.put("options", desc.menu_items.clone())?;
            }
            publish_value(&table, &desc, value)?;
            table.watch(&desc.name)?;
            bound.push(BoundControl {
                key: table.key(&desc.name),
                desc,
            });
        }
        Ok(ControlBindings { table, bound })
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// Applies an external write if `path` names one of our controls.
    /// Returns `false` when the path is not ours. The value actually in
    /// effect afterwards is republished either way.
    pub fn apply_write(
        &self,
        path: &str,
        value: &Value,
        device: &mut dyn CameraDevice,
    ) -> Result<bool> {
        let Some(bound) = self.bound.iter().find(|b| b.key == path) else {
            return Ok(false);
        };
        match value_from_json(&bound.desc, value) {
            Some(requested) => {
                let fixed = bound.desc.fix_value(requested);
                if let Err(err) = device.set_control(bound.desc.id, fixed) {
                    warn!("control '{}' rejected {fixed}: {err:#}", bound.desc.name);
                }
            }
            None => {
                warn!(
                    "control '{}' got malformed value {value}",
                    bound.desc.name
                );
            }
        }
        // drivers clamp on their own terms, so read back what stuck
        let actual = device.control_value(bound.desc.id)?;
        publish_value(&self.table, &bound.desc, actual)?;
        Ok(true)
    }

    /// Re-reads every control and republishes. Drivers move values on
    /// their own (auto-exposure and friends), so the worker calls this on
    /// a slow cadence.
    pub fn sync(&self, device: &mut dyn CameraDevice) -> Result<()> {
        for bound in &self.bound {
            match device.control_value(bound.desc.id) {
                Ok(value) => publish_value(&self.table, &bound.desc, value)?,
                Err(err) => warn!("control '{}' read failed: {err:#}", bound.desc.name),
            }
        }
        Ok(())
    }
}

fn publish_value(table: &Table, desc: &ControlDesc, value: i64) -> Result<()> {
    match desc.kind {
        ControlKind::Boolean => table.put(&desc.name, value != 0),
        ControlKind::Integer | ControlKind::Menu => table.put(&desc.name, value),
    }
}

fn value_from_json(desc: &ControlDesc, value: &Value) -> Option<i64> {
    match desc.kind {
        ControlKind::Boolean => value
            .as_bool()
            .map(i64::from)
            .or_else(|| value.as_i64().map(|v| i64::from(v != 0))),
        ControlKind::Integer | ControlKind::Menu => value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{open_device, storage_key};
    use crate::table::{KvBackend, MemoryBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn exposure() -> ControlDesc {
        ControlDesc::integer(9, "exposure", 10, 250, 25, 60)
    }

    #[test]
    fn fix_value_clamps_to_the_range() {
        let desc = exposure();
        assert_eq!(desc.fix_value(-5), 10);
        assert_eq!(desc.fix_value(10), 10);
        assert_eq!(desc.fix_value(900), 250);
    }

    #[test]
    fn fix_value_snaps_to_the_nearest_step() {
        let desc = exposure();
        assert_eq!(desc.fix_value(35), 35);
        assert_eq!(desc.fix_value(40), 35);
        assert_eq!(desc.fix_value(48), 60);
        assert_eq!(desc.fix_value(247), 235);
    }

    #[test]
    fn kind_names_round_trip_and_unknowns_fail() {
        for kind in [ControlKind::Boolean, ControlKind::Integer, ControlKind::Menu] {
            assert_eq!(kind.as_str().parse::<ControlKind>().unwrap(), kind);
        }
        let err = "slider".parse::<ControlKind>().unwrap_err();
        assert!(err.to_string().contains("unrecognized control kind"));
    }

    #[test]
    fn bindings_publish_metadata_and_apply_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let mut device = open_device("stub://checker").unwrap();
        device.open().unwrap();
        let key = storage_key(&device.source());
        let table = Table::root(backend.clone() as Arc<dyn KvBackend>, "facet")
            .child("cameras")
            .child(&key)
            .child("controls");
        let bindings = ControlBindings::publish(table.clone(), device.as_mut()).unwrap();
        assert!(!bindings.is_empty());

        let meta_key = "facet/cameras/checker/controls/.metadata/brightness/kind";
        assert_eq!(backend.get(meta_key), Some(json!("integer")));

        let value_key = "facet/cameras/checker/controls/brightness";
        assert!(backend.get(value_key).is_some());

        let applied = bindings
            .apply_write(value_key, &json!(200), device.as_mut())
            .unwrap();
        assert!(applied);
        assert_eq!(backend.get(value_key), Some(json!(200)));

        let foreign = bindings
            .apply_write("facet/cameras/checker/mode/selected", &json!(0), device.as_mut())
            .unwrap();
        assert!(!foreign);
    }

    #[test]
    fn malformed_writes_republish_the_current_value() {
        let backend = Arc::new(MemoryBackend::new());
        let mut device = open_device("stub://checker").unwrap();
        device.open().unwrap();
        let table = Table::root(backend.clone() as Arc<dyn KvBackend>, "c").child("controls");
        let bindings = ControlBindings::publish(table, device.as_mut()).unwrap();

        let value_key = "c/controls/brightness";
        let before = backend.get(value_key).unwrap();
        bindings
            .apply_write(value_key, &json!("bright"), device.as_mut())
            .unwrap();
        assert_eq!(backend.get(value_key), Some(before));
    }
}
