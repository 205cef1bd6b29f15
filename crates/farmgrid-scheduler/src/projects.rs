//! Project directory: per-project priority and asset render time history.

use std::collections::HashMap;

use farmgrid_store::{Entry, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::SchedulerResult;

/// Project metadata the scheduler consults.
pub trait ProjectDirectory: Send + Sync {
    /// Scheduling priority of a project.
    fn priority(&self, project: &str) -> f64;

    /// Append a render time sample to an asset's history under `key`
    /// (a frame number, or `"video"`).
    fn record_render_time(
        &self,
        project: &str,
        asset: &str,
        key: &str,
        seconds: f64,
        at: f64,
    ) -> SchedulerResult<()>;
}

/// Fixed priorities; samples are discarded.
#[derive(Debug, Clone)]
pub struct StaticProjects {
    priorities: HashMap<String, f64>,
    default_priority: f64,
}

impl StaticProjects {
    pub fn new(default_priority: f64) -> Self {
        Self {
            priorities: HashMap::new(),
            default_priority,
        }
    }

    pub fn with_priority(mut self, project: impl Into<String>, priority: f64) -> Self {
        self.priorities.insert(project.into(), priority);
        self
    }
}

impl Default for StaticProjects {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl ProjectDirectory for StaticProjects {
    fn priority(&self, project: &str) -> f64 {
        self.priorities
            .get(project)
            .copied()
            .unwrap_or(self.default_priority)
    }

    fn record_render_time(&self, _: &str, _: &str, _: &str, _: f64, _: f64) -> SchedulerResult<()> {
        Ok(())
    }
}

const PROJECT_FILE: &str = "project.json";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProjectFile {
    priority: Option<f64>,
}

/// One render time sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSample {
    pub at: f64,
    pub seconds: f64,
}

/// Projects kept in a keyed store:
///
/// ```text
/// <project>/project.json         {"priority": 2.0, ...}
/// <project>/<asset path>.json    {..., "render_time": {"17": [{"at": .., "seconds": ..}]}}
/// ```
///
/// Asset names may contain `/` to address nested directories.
#[derive(Clone)]
pub struct StoreProjects {
    store: Store,
    default_priority: f64,
}

impl StoreProjects {
    pub fn new(store: Store, default_priority: f64) -> Self {
        Self {
            store,
            default_priority,
        }
    }

    /// Render time samples recorded for an asset, keyed by frame.
    pub fn render_times(
        &self,
        project: &str,
        asset: &str,
    ) -> SchedulerResult<HashMap<String, Vec<RenderSample>>> {
        let Some(entry) = self.asset_entry(project, asset, false)? else {
            return Ok(HashMap::new());
        };
        let Some(Value::Object(mut doc)) = self.store.read_json::<Value>(&entry)? else {
            return Ok(HashMap::new());
        };
        Ok(doc
            .remove("render_time")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    /// Locate (and with `create`, make) the asset's JSON file.
    fn asset_entry(&self, project: &str, asset: &str, create: bool) -> SchedulerResult<Option<Entry>> {
        let mut path: Vec<String> = vec![project.to_string()];
        path.extend(
            asset
                .split('/')
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
        let Some(last) = path.last_mut() else {
            return Ok(None);
        };
        last.push_str(".json");

        match self.store.get(&path) {
            Ok(entry) => return Ok(Some(entry)),
            Err(e) if e.is_not_found() && create => {}
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let (name, dirs) = path.split_last().ok_or_else(|| {
            StoreError::InvalidOperation("empty asset path".to_string())
        })?;
        let dir = self.store.create_directory(dirs)?;
        let entry = self.store.create_json_file(&dir, name, &json!({}))?;
        Ok(Some(entry))
    }
}

impl ProjectDirectory for StoreProjects {
    fn priority(&self, project: &str) -> f64 {
        self.store
            .get(&[project, PROJECT_FILE])
            .ok()
            .and_then(|entry| self.store.read_json::<ProjectFile>(&entry).ok().flatten())
            .and_then(|file| file.priority)
            .unwrap_or(self.default_priority)
    }

    fn record_render_time(
        &self,
        project: &str,
        asset: &str,
        key: &str,
        seconds: f64,
        at: f64,
    ) -> SchedulerResult<()> {
        let Some(entry) = self.asset_entry(project, asset, true)? else {
            return Ok(());
        };

        let mut doc = match self.store.read_json::<Value>(&entry)? {
            Some(Value::Object(doc)) => doc,
            _ => Map::new(),
        };
        let history = doc
            .entry("render_time")
            .or_insert_with(|| Value::Object(Map::new()));
        if !history.is_object() {
            *history = Value::Object(Map::new());
        }
        if let Value::Object(history) = history {
            let samples = history
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !samples.is_array() {
                *samples = Value::Array(Vec::new());
            }
            if let Value::Array(samples) = samples {
                samples.push(json!({ "at": at, "seconds": seconds }));
            }
        }

        self.store.write_json(&entry, &Value::Object(doc))?;
        debug!(%project, %asset, %key, seconds, "render time recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmgrid_store::{JsonCodec, StoreOptions};
    use std::time::Duration;

    fn store(dir: &std::path::Path) -> Store {
        Store::open(
            dir,
            StoreOptions {
                dir_ttl: Duration::ZERO,
                ..StoreOptions::default()
            },
        )
        .unwrap()
        .with_codec(JsonCodec)
    }

    #[test]
    fn static_priorities() {
        let projects = StaticProjects::new(1.0).with_priority("feature", 4.0);
        assert_eq!(projects.priority("feature"), 4.0);
        assert_eq!(projects.priority("other"), 1.0);
        projects.record_render_time("feature", "a", "1", 1.0, 0.0).unwrap();
    }

    #[test]
    fn store_priority_from_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let project = store.create_directory(&["feature"]).unwrap();
        store
            .create_json_file(&project, PROJECT_FILE, &json!({"priority": 3.5, "title": "F"}))
            .unwrap();

        let projects = StoreProjects::new(store, 1.0);
        assert_eq!(projects.priority("feature"), 3.5);
        assert_eq!(projects.priority("unknown"), 1.0);
    }

    #[test]
    fn samples_are_appended_to_asset_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let projects = StoreProjects::new(store.clone(), 1.0);

        projects.record_render_time("feature", "chars/hero", "12", 30.0, 100.0).unwrap();
        projects.record_render_time("feature", "chars/hero", "12", 28.0, 200.0).unwrap();
        projects.record_render_time("feature", "chars/hero", "13", 31.0, 300.0).unwrap();

        let times = projects.render_times("feature", "chars/hero").unwrap();
        assert_eq!(
            times["12"],
            vec![
                RenderSample { at: 100.0, seconds: 30.0 },
                RenderSample { at: 200.0, seconds: 28.0 },
            ]
        );
        assert_eq!(times["13"].len(), 1);
        assert!(dir.path().join("feature/chars/hero.json").is_file());
    }

    #[test]
    fn existing_asset_fields_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let project = store.create_directory(&["feature"]).unwrap();
        store
            .create_json_file(&project, "prop.json", &json!({"label": "chair"}))
            .unwrap();

        let projects = StoreProjects::new(store.clone(), 1.0);
        projects.record_render_time("feature", "prop", "video", 90.0, 1.0).unwrap();

        let entry = store.get(&["feature", "prop.json"]).unwrap();
        let doc: Value = store.read_json(&entry).unwrap().unwrap();
        assert_eq!(doc["label"], "chair");
        assert_eq!(doc["render_time"]["video"][0]["seconds"], 90.0);
    }
}
