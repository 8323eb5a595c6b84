//! Label and annotation conventions stamped on every managed object.

use std::collections::BTreeMap;

/// Value of the managed-by label and default field manager.
pub const TOOL_NAME: &str = "kiln";

pub const DEFAULT_FIELD_MANAGER: &str = "kiln";

/// Selector label carried by every object and pod template.
pub const APP_LABEL: &str = "app";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Logical app name that rendered the object.
pub const OWNER_ANNOTATION: &str = "kiln.dev/owner";

/// Revision fingerprint of the bundle the object was rendered in.
pub const FINGERPRINT_ANNOTATION: &str = "kiln.dev/fingerprint";

/// Content hash of the object itself, used to classify unchanged applies.
pub const OBJECT_HASH_ANNOTATION: &str = "kiln.dev/object-hash";

/// Marks the Secret holding an app's release history.
pub const RECORD_LABEL: &str = "kiln.dev/record";

/// Marks preview namespaces with the app they belong to.
pub const PREVIEW_LABEL: &str = "kiln.dev/preview";

pub const PREVIEW_CREATED_ANNOTATION: &str = "kiln.dev/created-at";

/// Base labels for an object belonging to `app`.
pub fn base_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (MANAGED_BY_LABEL.to_string(), TOOL_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), app.to_string()),
        (PART_OF_LABEL.to_string(), app.to_string()),
    ])
}

/// Base labels plus a component label.
pub fn component_labels(app: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = base_labels(app);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

pub fn is_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(TOOL_NAME)
}
