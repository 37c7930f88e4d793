//! Replayable YAML workflows, as stored in the plan cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::types::PlanningAction;

/// A named sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTask {
    pub name: String,
    #[serde(default)]
    pub flow: Vec<PlanningAction>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,
}

/// A workflow script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowScript {
    #[serde(default)]
    pub tasks: Vec<ScriptTask>,
}

impl WorkflowScript {
    pub fn parse(yaml: &str) -> Result<Self, EngineError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, EngineError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// One-task script replaying `actions`. Terminal markers are dropped and
    /// planner boxes are stripped so replays re-resolve through the cache.
    pub fn from_actions(name: impl Into<String>, actions: &[PlanningAction]) -> Self {
        let flow = actions
            .iter()
            .filter(|action| !matches!(action.action_type.as_str(), "Finished" | "Error"))
            .map(|action| {
                let mut action = action.clone();
                strip_bboxes(&mut action.param);
                if let Some(locate) = action.locate.as_mut() {
                    locate.bbox = None;
                }
                action
            })
            .collect();
        Self {
            tasks: vec![ScriptTask {
                name: name.into(),
                flow,
                continue_on_error: false,
            }],
        }
    }

    pub fn step_count(&self) -> usize {
        self.tasks.iter().map(|task| task.flow.len()).sum()
    }
}

/// Remove `bbox` from every locate-shaped object (`prompt` plus `bbox`).
fn strip_bboxes(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.contains_key("prompt") {
                map.remove("bbox");
            }
            for child in map.values_mut() {
                strip_bboxes(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_bboxes),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_actions_strips_boxes_and_markers() {
        let actions = vec![
            PlanningAction::new(
                "Tap",
                json!({ "locate": { "prompt": "OK", "bbox": [0, 0, 10, 10] } }),
            ),
            PlanningAction::finished(),
        ];
        let script = WorkflowScript::from_actions("confirm", &actions);
        assert_eq!(script.step_count(), 1);
        let step = &script.tasks[0].flow[0];
        assert_eq!(step.param["locate"]["prompt"], "OK");
        assert!(step.param["locate"].get("bbox").is_none());
    }

    #[test]
    fn test_yaml_round_trip_shape() {
        let yaml = "tasks:\n  - name: search\n    flow:\n      - type: Tap\n        param:\n          locate: search box\n      - type: Input\n        param:\n          locate: search box\n          value: rust\n";
        let script = WorkflowScript::parse(yaml).unwrap();
        assert_eq!(script.tasks[0].name, "search");
        assert_eq!(script.tasks[0].flow[1].param["value"], "rust");
        assert!(!script.tasks[0].continue_on_error);

        let written = script.to_yaml().unwrap();
        assert_eq!(WorkflowScript::parse(&written).unwrap(), script);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            WorkflowScript::parse("tasks: 5"),
            Err(EngineError::Workflow(_))
        ));
    }
}
