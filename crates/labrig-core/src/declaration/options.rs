use crate::declaration::DeclarationResult;
use crate::models::{CoreError, CoreErrorKind, MissingPolicy, ModuleOptions, OptionDescriptor};

/// Merges configured options with an implementation's option declarations.
///
/// Declared options come first in declaration order, followed by any extra
/// keys the configuration carried.
pub fn apply_option_descriptors(
    module: &str,
    descriptors: &[OptionDescriptor],
    configured: &ModuleOptions,
) -> DeclarationResult<ModuleOptions> {
    let mut applied = ModuleOptions::new();

    for descriptor in descriptors {
        if let Some(value) = configured.get(&descriptor.name) {
            applied.insert(descriptor.name.clone(), value.clone());
            continue;
        }

        match descriptor.missing {
            MissingPolicy::Error => {
                return Err(CoreError::for_module(
                    module,
                    CoreErrorKind::InvalidInput,
                    format!("required option '{}' is missing", descriptor.name),
                ));
            }
            MissingPolicy::Warn => {
                tracing::warn!(
                    module,
                    option = %descriptor.name,
                    default = ?descriptor.default,
                    "option missing from configuration, using default"
                );
            }
            MissingPolicy::Silent => {}
        }
        if let Some(default) = &descriptor.default {
            applied.insert(descriptor.name.clone(), default.clone());
        }
    }

    for (key, value) in configured {
        if !applied.contains_key(key) {
            tracing::debug!(module, option = %key, "passing through undeclared option");
            applied.insert(key.clone(), value.clone());
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn configured(pairs: &[(&str, serde_json::Value)]) -> ModuleOptions {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn missing_required_option_is_rejected() {
        let error = apply_option_descriptors(
            "magnet",
            &[OptionDescriptor::required("gpib_address_z")],
            &ModuleOptions::new(),
        )
        .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(error.module.as_deref(), Some("magnet"));
    }

    #[test]
    fn defaults_fill_missing_options_and_extras_pass_through() {
        let applied = apply_option_descriptors(
            "scanner",
            &[
                OptionDescriptor::with_default("clock_frequency", 100).warn_if_missing(),
                OptionDescriptor::with_default("scanmode", "SWEEP"),
            ],
            &configured(&[("scanmode", json!("LIST")), ("comment", json!("bench 2"))]),
        )
        .unwrap();

        let keys: Vec<&str> = applied.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["clock_frequency", "scanmode", "comment"]);
        assert_eq!(applied["clock_frequency"], json!(100));
        assert_eq!(applied["scanmode"], json!("LIST"));
    }
}
