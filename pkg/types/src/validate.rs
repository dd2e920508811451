use pkg_constants::state::MAX_NAME_LEN;

use crate::error::{ControlError, Result};
use crate::replicaset::{ReplicaSet, ReplicaSetSpec};

fn invalid(msg: String) -> ControlError {
    ControlError::Validation(msg)
}

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid(format!(
            "name '{}' exceeds {} characters (got {})",
            name,
            MAX_NAME_LEN,
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid(format!(
            "name '{}' must not start or end with a hyphen",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(format!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        )));
    }
    Ok(())
}

/// The selector must be non-empty and satisfied by the template's labels,
/// otherwise the ReplicaSet could never observe the pods it creates.
pub fn validate_spec(spec: &ReplicaSetSpec) -> Result<()> {
    if spec.template.image.trim().is_empty() {
        return Err(invalid("template image must not be empty".to_string()));
    }
    if spec.selector.is_empty() {
        return Err(invalid("selector must not be empty".to_string()));
    }
    for (key, value) in &spec.selector {
        match spec.template.labels.get(key) {
            Some(v) if v == value => {}
            Some(v) => {
                return Err(invalid(format!(
                    "selector {}={} does not match template label {}={}",
                    key, value, key, v
                )));
            }
            None => {
                return Err(invalid(format!(
                    "selector {}={} is missing from template labels",
                    key, value
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_replicaset(rs: &ReplicaSet) -> Result<()> {
    validate_name(&rs.name)?;
    validate_spec(&rs.spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::PodTemplate;
    use std::collections::HashMap;

    fn spec(selector: &[(&str, &str)], labels: &[(&str, &str)]) -> ReplicaSetSpec {
        let map = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        ReplicaSetSpec {
            replicas: 1,
            selector: map(selector),
            template: PodTemplate {
                image: "nginx:1.27".to_string(),
                labels: map(labels),
                node_affinity: HashMap::new(),
            },
        }
    }

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("app-123").is_ok());
        assert!(validate_name("a").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("my_app").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn selector_must_be_satisfied_by_template() {
        assert!(validate_spec(&spec(&[("app", "web")], &[("app", "web"), ("tier", "fe")])).is_ok());
        assert!(matches!(
            validate_spec(&spec(&[("app", "web")], &[("app", "api")])),
            Err(ControlError::Validation(_))
        ));
        assert!(validate_spec(&spec(&[("app", "web")], &[])).is_err());
        assert!(validate_spec(&spec(&[], &[("app", "web")])).is_err());
    }
}
