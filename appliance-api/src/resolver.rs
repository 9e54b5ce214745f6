//! Deterministic mapping between a CSI volume/snapshot creation request and
//! the appliance's dataset/zvol path, including adoption of unmanaged
//! entities.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_ALNUM_HYPHEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9-]").unwrap());
static MULTI_HYPHEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").unwrap());

const MAX_NAME_LEN: usize = 63;

/// Variables substituted into a `name_template`. Matched case-sensitively
/// against `{PVCName}`, `{PVCNamespace}`, `{PVName}` placeholders.
#[derive(Debug, Clone)]
pub struct NameVars<'a> {
    pub pvc_name: &'a str,
    pub pvc_namespace: &'a str,
    pub pv_name: &'a str,
}

impl<'a> NameVars<'a> {
    fn substitute(&self, template: &str) -> String {
        template
            .replace("{PVCName}", self.pvc_name)
            .replace("{PVCNamespace}", self.pvc_namespace)
            .replace("{PVName}", self.pv_name)
    }
}

/// Resolves a CSI-facing name into a sanitized, length-bounded appliance
/// entity name, honoring `name_template` precedence over prefix/suffix.
pub fn resolve_name(
    vars: &NameVars,
    name_template: Option<&str>,
    name_prefix: Option<&str>,
    name_suffix: Option<&str>,
) -> String {
    let raw = match name_template {
        Some(template) => vars.substitute(template),
        None => format!(
            "{}{}{}",
            name_prefix.unwrap_or_default(),
            vars.pv_name,
            name_suffix.unwrap_or_default()
        ),
    };
    sanitize(&raw)
}

/// non-alphanumeric/non-hyphen -> hyphen, collapse runs, strip ends, cap
/// at 63 characters (the appliance's dataset-component length limit).
pub fn sanitize(name: &str) -> String {
    let replaced = NON_ALNUM_HYPHEN.replace_all(name, "-");
    let collapsed = MULTI_HYPHEN.replace_all(&replaced, "-");
    let trimmed = collapsed.trim_matches('-');
    if trimmed.len() > MAX_NAME_LEN {
        trimmed[..MAX_NAME_LEN].trim_end_matches('-').to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<pool>[/<parent_dataset>]/<sanitized_name>`.
pub fn assemble_path(pool: &str, parent_dataset: Option<&str>, sanitized_name: &str) -> String {
    match parent_dataset {
        Some(parent) if !parent.is_empty() => format!("{}/{}/{}", pool, parent, sanitized_name),
        _ => format!("{}/{}", pool, sanitized_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize("--my_volume..01--"), "my-volume-01");
        assert_eq!(sanitize("Already-Clean"), "Already-Clean");
    }

    #[test]
    fn sanitize_truncates_to_63() {
        let long = "a".repeat(100);
        assert_eq!(sanitize(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn resolve_name_prefers_template() {
        let vars = NameVars {
            pvc_name: "data",
            pvc_namespace: "prod",
            pv_name: "pvc-1234",
        };
        let resolved = resolve_name(&vars, Some("{PVCNamespace}-{PVCName}"), None, None);
        assert_eq!(resolved, "prod-data");
    }

    #[test]
    fn resolve_name_falls_back_to_prefix_suffix() {
        let vars = NameVars {
            pvc_name: "data",
            pvc_namespace: "prod",
            pv_name: "pvc-1234",
        };
        let resolved = resolve_name(&vars, None, Some("csi-"), Some("-vol"));
        assert_eq!(resolved, "csi-pvc-1234-vol");
    }

    #[test]
    fn assemble_path_with_and_without_parent() {
        assert_eq!(assemble_path("tank", None, "vol-1"), "tank/vol-1");
        assert_eq!(
            assemble_path("tank", Some("csi"), "vol-1"),
            "tank/csi/vol-1"
        );
    }
}
