//! Control switches
//!
//! Feature toggles start from command line values and can be flipped at runtime
//! through the `features` object of the control ConfigMap. Every switch keeps the
//! value it was started with so that a broken or removed ConfigMap falls back to
//! the operator's startup choice, never to whatever was last active.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use tracing::{info, warn};

use crate::CONFIGMAP_MAIN_FILE_KEY;

/// Initial and active state of one boolean feature
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchState {
    /// Value set once at process start
    pub initial: bool,
    /// Value currently in effect
    pub active: bool,
}

impl SwitchState {
    /// Create a switch whose active value equals its initial value
    pub fn new(initial: bool) -> Self {
        Self {
            initial,
            active: initial,
        }
    }

    fn reset(&mut self) {
        self.active = self.initial;
    }

    fn apply(&mut self, value: Option<bool>) {
        self.active = value.unwrap_or(self.initial);
    }
}

/// The `features` object of the control ConfigMap
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Features {
    enable_huge_page_down_api: Option<bool>,
    enable_honor_existing_resources: Option<bool>,
    network_resource_name_keys: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ControlDocument {
    features: Option<Features>,
}

/// Runtime feature configuration consulted on every admission call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlSwitches {
    hugepage_down_api: SwitchState,
    honor_existing_resources: SwitchState,
    initial_resource_name_keys: Vec<String>,
    resource_name_keys: Vec<String>,
}

impl ControlSwitches {
    /// Build switches from startup values.
    ///
    /// `resource_name_keys` is the comma separated `--network-resource-name-keys` flag.
    pub fn new(
        inject_hugepage_down_api: bool,
        honor_existing_resources: bool,
        resource_name_keys: &str,
    ) -> Self {
        let keys = parse_resource_name_keys(resource_name_keys);
        Self {
            hugepage_down_api: SwitchState::new(inject_hugepage_down_api),
            honor_existing_resources: SwitchState::new(honor_existing_resources),
            initial_resource_name_keys: keys.clone(),
            resource_name_keys: keys,
        }
    }

    /// Whether hugepage sizes are exposed through the downward API
    pub fn is_hugepage_down_api_enabled(&self) -> bool {
        self.hugepage_down_api.active
    }

    /// Whether injected resources are added on top of existing requests/limits
    pub fn is_honor_existing_resources_enabled(&self) -> bool {
        self.honor_existing_resources.active
    }

    /// Whether any resource-name key is configured
    pub fn is_resource_names_enabled(&self) -> bool {
        !self.resource_name_keys.is_empty()
    }

    /// Annotation keys consulted on a NetworkAttachmentDefinition for its resource name
    pub fn resource_name_keys(&self) -> &[String] {
        &self.resource_name_keys
    }

    /// Revert every switch to its startup value
    pub fn reset_to_initial(&mut self) {
        self.hugepage_down_api.reset();
        self.honor_existing_resources.reset();
        self.resource_name_keys = self.initial_resource_name_keys.clone();
    }

    /// Apply the control ConfigMap data.
    ///
    /// A feature missing from `features` reverts to its startup value. A missing
    /// `config.json`, a missing `features` object or any decode failure reverts
    /// all of them.
    pub fn apply_control_config(&mut self, data: &BTreeMap<String, String>) {
        let Some(document) = data.get(CONFIGMAP_MAIN_FILE_KEY) else {
            warn!(
                key = CONFIGMAP_MAIN_FILE_KEY,
                "Control ConfigMap has no main key, restoring initial switches"
            );
            self.reset_to_initial();
            return;
        };

        let features = match serde_json::from_str::<ControlDocument>(document) {
            Ok(ControlDocument {
                features: Some(features),
            }) => features,
            Ok(ControlDocument { features: None }) => {
                warn!("Control ConfigMap has no features object, restoring initial switches");
                self.reset_to_initial();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode control switches, restoring initial switches");
                self.reset_to_initial();
                return;
            }
        };

        self.hugepage_down_api
            .apply(features.enable_huge_page_down_api);
        self.honor_existing_resources
            .apply(features.enable_honor_existing_resources);
        self.resource_name_keys = match features.network_resource_name_keys {
            Some(keys) => clean_keys(keys),
            None => self.initial_resource_name_keys.clone(),
        };

        info!(switches = %self, "Control switches updated");
    }
}

impl fmt::Display for ControlSwitches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HugePageInject: {} / HonorExistingResources: {} / EnableResourceNames: {}",
            self.is_hugepage_down_api_enabled(),
            self.is_honor_existing_resources_enabled(),
            self.is_resource_names_enabled()
        )
    }
}

/// Split a comma separated key list, trimming whitespace and dropping empty entries
pub fn parse_resource_name_keys(keys: &str) -> Vec<String> {
    clean_keys(keys.split(','))
}

fn clean_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| k.as_ref().trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(document: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(CONFIGMAP_MAIN_FILE_KEY.to_string(), document.to_string())])
    }

    // =========================================================================
    // Startup values
    // =========================================================================

    #[test]
    fn resource_name_keys_are_trimmed_and_split() {
        let switches = ControlSwitches::new(false, false, " a/resourceName , b/resourceName,,");
        assert_eq!(
            switches.resource_name_keys(),
            &["a/resourceName".to_string(), "b/resourceName".to_string()]
        );
        assert!(switches.is_resource_names_enabled());
    }

    #[test]
    fn empty_key_flag_disables_resource_names() {
        let switches = ControlSwitches::new(false, false, "");
        assert!(!switches.is_resource_names_enabled());
    }

    // =========================================================================
    // Story Tests: runtime updates
    // =========================================================================

    /// Story: operator turns hugepage injection on through the ConfigMap
    #[test]
    fn story_configmap_enables_feature() {
        let mut switches = ControlSwitches::new(false, false, crate::DEFAULT_RESOURCE_NAME_KEY);
        switches.apply_control_config(&data(r#"{"features":{"enableHugePageDownApi":true}}"#));

        assert!(switches.is_hugepage_down_api_enabled());
        assert!(!switches.is_honor_existing_resources_enabled());
    }

    /// Story: a feature missing from the ConfigMap falls back to its startup
    /// value, not to false
    #[test]
    fn story_missing_feature_restores_initial_not_false() {
        let mut switches = ControlSwitches::new(false, true, crate::DEFAULT_RESOURCE_NAME_KEY);
        switches.apply_control_config(&data(
            r#"{"features":{"enableHugePageDownApi":true,"enableHonorExistingResources":false}}"#,
        ));
        assert!(!switches.is_honor_existing_resources_enabled());

        switches.apply_control_config(&data(r#"{"features":{"enableHugePageDownApi":true}}"#));
        assert!(switches.is_hugepage_down_api_enabled());
        assert!(switches.is_honor_existing_resources_enabled());
    }

    /// Story: malformed JSON is fail-safe, every switch returns to its initial value
    #[test]
    fn story_malformed_json_restores_all_initial_values() {
        let mut switches = ControlSwitches::new(true, false, "a");
        switches.apply_control_config(&data(
            r#"{"features":{"enableHugePageDownApi":false,"enableHonorExistingResources":true,"networkResourceNameKeys":["b"]}}"#,
        ));
        assert!(!switches.is_hugepage_down_api_enabled());
        assert!(switches.is_honor_existing_resources_enabled());
        assert_eq!(switches.resource_name_keys(), &["b".to_string()]);

        switches.apply_control_config(&data(r#"{"features": "#));
        assert!(switches.is_hugepage_down_api_enabled());
        assert!(!switches.is_honor_existing_resources_enabled());
        assert_eq!(switches.resource_name_keys(), &["a".to_string()]);
    }

    /// Story: a non-boolean flag value counts as a parse failure
    #[test]
    fn story_wrong_value_type_restores_all_initial_values() {
        let mut switches = ControlSwitches::new(false, false, "a");
        switches.apply_control_config(&data(r#"{"features":{"enableHugePageDownApi":true}}"#));
        assert!(switches.is_hugepage_down_api_enabled());

        switches.apply_control_config(&data(
            r#"{"features":{"enableHugePageDownApi":true,"enableHonorExistingResources":"yes"}}"#,
        ));
        assert!(!switches.is_hugepage_down_api_enabled());
        assert!(!switches.is_honor_existing_resources_enabled());
    }

    #[test]
    fn missing_main_key_restores_initial_values() {
        let mut switches = ControlSwitches::new(false, false, "a");
        switches.apply_control_config(&data(r#"{"features":{"enableHonorExistingResources":true}}"#));
        assert!(switches.is_honor_existing_resources_enabled());

        switches.apply_control_config(&BTreeMap::new());
        assert!(!switches.is_honor_existing_resources_enabled());
    }

    #[test]
    fn missing_features_object_restores_initial_values() {
        let mut switches = ControlSwitches::new(false, false, "a");
        switches.apply_control_config(&data(r#"{"features":{"enableHugePageDownApi":true}}"#));
        switches.apply_control_config(&data(r#"{"user-defined-injections":{}}"#));
        assert!(!switches.is_hugepage_down_api_enabled());
    }

    #[test]
    fn resource_name_keys_follow_configmap() {
        let mut switches = ControlSwitches::new(false, false, "a");
        switches.apply_control_config(&data(
            r#"{"features":{"networkResourceNameKeys":[" b ","c",""]}}"#,
        ));
        assert_eq!(
            switches.resource_name_keys(),
            &["b".to_string(), "c".to_string()]
        );

        switches.apply_control_config(&data(r#"{"features":{}}"#));
        assert_eq!(switches.resource_name_keys(), &["a".to_string()]);
    }

    #[test]
    fn summary_lists_every_feature() {
        let switches = ControlSwitches::new(true, false, "a");
        assert_eq!(
            switches.to_string(),
            "HugePageInject: true / HonorExistingResources: false / EnableResourceNames: true"
        );
    }
}
