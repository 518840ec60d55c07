//! Substitution of user inputs into a workflow-api graph.
//!
//! External-input nodes carry an `input_id` in their inputs map. Every
//! node whose `input_id` matches a submitted key gets that value written
//! over the `input_id` slot; text nodes also get `default_value` so the
//! value survives node-side defaulting.

use std::collections::HashMap;

use serde_json::Value;

/// User-submitted inputs, keyed by input id.
pub type RunInputs = HashMap<String, Value>;

const EXTERNAL_TEXT_NODE: &str = "ComfyUIDeployExternalText";

/// Rewrite `workflow_api` in place, substituting each matching external
/// input. Unknown keys are ignored; nodes without an `input_id` are left
/// untouched.
pub fn apply_external_inputs(workflow_api: &mut Value, inputs: &RunInputs) {
    let Some(nodes) = workflow_api.as_object_mut() else {
        return;
    };

    for node in nodes.values_mut() {
        let class_type = node
            .get("class_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(node_inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };

        let Some(input_id) = node_inputs.get("input_id").and_then(Value::as_str) else {
            continue;
        };

        if let Some(value) = inputs.get(input_id) {
            let value = value.clone();
            node_inputs.insert("input_id".to_string(), value.clone());

            if class_type.as_deref() == Some(EXTERNAL_TEXT_NODE) {
                node_inputs.insert("default_value".to_string(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> Value {
        json!({
            "1": {
                "class_type": "ComfyUIDeployExternalText",
                "inputs": { "input_id": "prompt", "default_value": "a cat" }
            },
            "2": {
                "class_type": "ComfyUIDeployExternalNumber",
                "inputs": { "input_id": "steps" }
            },
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 42 }
            }
        })
    }

    #[test]
    fn matching_inputs_replace_the_input_id_slot() {
        let mut api = graph();
        let inputs = RunInputs::from([("steps".to_string(), json!(20))]);

        apply_external_inputs(&mut api, &inputs);

        assert_eq!(api["2"]["inputs"]["input_id"], json!(20));
        // untouched nodes keep their values
        assert_eq!(api["1"]["inputs"]["input_id"], json!("prompt"));
        assert_eq!(api["3"]["inputs"]["seed"], json!(42));
    }

    #[test]
    fn external_text_nodes_also_get_default_value() {
        let mut api = graph();
        let inputs = RunInputs::from([("prompt".to_string(), json!("a dog"))]);

        apply_external_inputs(&mut api, &inputs);

        assert_eq!(api["1"]["inputs"]["input_id"], json!("a dog"));
        assert_eq!(api["1"]["inputs"]["default_value"], json!("a dog"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut api = graph();
        let before = api.clone();
        let inputs = RunInputs::from([("nonexistent".to_string(), json!("x"))]);

        apply_external_inputs(&mut api, &inputs);

        assert_eq!(api, before);
    }

    #[test]
    fn non_object_graph_is_left_alone() {
        let mut api = json!([1, 2, 3]);
        apply_external_inputs(&mut api, &RunInputs::new());
        assert_eq!(api, json!([1, 2, 3]));
    }
}
