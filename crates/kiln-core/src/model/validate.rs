//! Structural validation of an [`AppModel`].
//!
//! Runs before rendering. The first problem found is returned as
//! [`KilnError::InvalidModel`] naming the offending field.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{KilnError, Result};
use crate::model::quantity::parse_quantity;
use crate::model::{AppModel, Resources, ServiceModel, Topology};

const MAX_NAME_LEN: usize = 63;

/// StatefulSet pods carry a `controller-revision-hash` label of
/// `<name>-<hash10>`, which must fit a label value.
const MAX_STATEFULSET_NAME_LEN: usize = 52;

pub fn validate(model: &AppModel) -> Result<()> {
    check_dns_label("name", &model.name)?;
    check_dns_label("namespace", &model.namespace)?;

    validate_services(model)?;
    validate_env_names("env", model.env.iter().map(|e| e.name.as_str()))?;
    validate_env_names("secrets", model.secrets.literal.keys().map(String::as_str))?;
    validate_dependencies(model)?;
    validate_ingress(model)?;
    validate_volumes(model)?;
    validate_jobs(model)?;

    Ok(())
}

/// DNS-1123 label: lowercase alphanumerics and '-', starting and ending
/// alphanumeric, at most 63 characters.
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_NAME_LEN
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// Names the renderer derives from user input must still be labels that fit `limit`.
fn check_derived_name(field: &str, name: &str, limit: usize) -> Result<()> {
    if is_dns_label(name) && name.len() <= limit {
        Ok(())
    } else {
        Err(KilnError::invalid(
            field,
            format!(
                "derived object name '{}' is not a DNS-1123 label of at most {} characters",
                name, limit
            ),
        ))
    }
}

fn check_dns_label(field: &str, value: &str) -> Result<()> {
    if is_dns_label(value) {
        Ok(())
    } else {
        Err(KilnError::invalid(
            field,
            format!(
                "'{}' must be a DNS-1123 label (lowercase alphanumerics and '-', at most {} characters)",
                value, MAX_NAME_LEN
            ),
        ))
    }
}

/// Environment variable names: letters, digits and '_', not starting with a digit.
pub fn is_env_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_env_names<'a>(field: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    for name in names {
        if !is_env_name(name) {
            return Err(KilnError::invalid(
                field,
                format!("'{}' is not a valid environment variable name", name),
            ));
        }
    }
    Ok(())
}

fn validate_services(model: &AppModel) -> Result<()> {
    if model.services.is_empty() {
        return Err(KilnError::invalid("services", "at least one service is required"));
    }
    if model.topology == Topology::Single && model.services.len() != 1 {
        return Err(KilnError::invalid(
            "services",
            "a single-service app cannot declare sub-services",
        ));
    }

    let mut seen = BTreeSet::new();
    for service in &model.services {
        let field = format!("services[{}]", service.name);
        check_dns_label(&format!("{field}.name"), &service.name)?;
        if !seen.insert(service.name.as_str()) {
            return Err(KilnError::invalid(
                "services",
                format!("service '{}' is declared more than once", service.name),
            ));
        }

        // Config maps get a "-config" suffix, so leave room for it.
        let workload = model.workload_name(&service.name);
        if workload.len() + "-config".len() > MAX_NAME_LEN {
            return Err(KilnError::invalid(
                format!("{field}.name"),
                format!("derived object name '{}' is too long", workload),
            ));
        }

        validate_service(&field, service)?;
    }

    for service in &model.services {
        for target in &service.depends_on {
            if !seen.contains(target.as_str()) {
                return Err(KilnError::invalid(
                    format!("services[{}].dependsOn", service.name),
                    format!("unknown service '{}'", target),
                ));
            }
        }
    }

    if let Some(cycle) = find_cycle(&model.services) {
        let edges: Vec<String> = cycle
            .windows(2)
            .map(|pair| format!("{} -> {}", pair[0], pair[1]))
            .collect();
        return Err(KilnError::invalid(
            "services",
            format!("dependsOn cycle: {}", edges.join(", ")),
        ));
    }

    Ok(())
}

fn validate_service(field: &str, service: &ServiceModel) -> Result<()> {
    if service.image.trim().is_empty() {
        return Err(KilnError::invalid(format!("{field}.image"), "image is required"));
    }
    if service.port == 0 {
        return Err(KilnError::invalid(
            format!("{field}.port"),
            "port must be between 1 and 65535",
        ));
    }
    if service.replicas < 0 {
        return Err(KilnError::invalid(
            format!("{field}.replicas"),
            format!("replicas must not be negative, got {}", service.replicas),
        ));
    }
    if let Some(path) = &service.health_path {
        if !path.starts_with('/') {
            return Err(KilnError::invalid(
                format!("{field}.health.path"),
                format!("'{}' must start with '/'", path),
            ));
        }
    }
    validate_env_names(
        &format!("{field}.env"),
        service.env.iter().map(|e| e.name.as_str()),
    )?;
    if let Some(resources) = &service.resources {
        validate_resources(&format!("{field}.resources"), resources)?;
    }
    Ok(())
}

fn validate_resources(field: &str, resources: &Resources) -> Result<()> {
    let pairs = [
        ("cpu", &resources.requests.cpu, &resources.limits.cpu),
        ("memory", &resources.requests.memory, &resources.limits.memory),
    ];

    for (resource, request, limit) in pairs {
        let request_value =
            parse_field(&format!("{field}.requests.{resource}"), request.as_deref())?;
        let limit_value = parse_field(&format!("{field}.limits.{resource}"), limit.as_deref())?;

        if let (Some(req), Some(lim), Some(req_raw), Some(lim_raw)) =
            (request_value, limit_value, request, limit)
        {
            if req > lim {
                return Err(KilnError::invalid(
                    format!("{field}.{resource}"),
                    format!("request {} exceeds limit {}", req_raw, lim_raw),
                ));
            }
        }
    }
    Ok(())
}

fn parse_field(field: &str, raw: Option<&str>) -> Result<Option<f64>> {
    match raw {
        None => Ok(None),
        Some(value) => parse_quantity(value)
            .map(Some)
            .ok_or_else(|| KilnError::invalid(field, format!("'{}' is not a valid quantity", value))),
    }
}

/// Returns the names along a dependsOn cycle, first name repeated at the end.
fn find_cycle(services: &[ServiceModel]) -> Option<Vec<String>> {
    let edges: BTreeMap<&str, Vec<&str>> = services
        .iter()
        .map(|s| {
            let mut targets: Vec<&str> = s.depends_on.iter().map(String::as_str).collect();
            targets.sort_unstable();
            (s.name.as_str(), targets)
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        for &next in edges.get(node).map(Vec::as_slice).unwrap_or_default() {
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for &node in edges.keys() {
        if marks.contains_key(node) {
            continue;
        }
        let mut stack = Vec::new();
        if let Some(cycle) = visit(node, &edges, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn validate_dependencies(model: &AppModel) -> Result<()> {
    let mut seen = BTreeSet::new();
    for dependency in &model.dependencies {
        let field = format!("dependencies[{}]", dependency.kind);
        if !seen.insert(dependency.kind) {
            return Err(KilnError::invalid(
                "dependencies",
                format!("dependency '{}' is declared more than once", dependency.kind),
            ));
        }
        if let Some(storage) = &dependency.storage {
            parse_field(&format!("{field}.storage"), Some(storage))?;
        }
        if let Some(version) = &dependency.version {
            if version.is_empty() || version.contains(char::is_whitespace) {
                return Err(KilnError::invalid(
                    format!("{field}.version"),
                    format!("'{}' is not a valid image tag", version),
                ));
            }
        }
        check_derived_name(
            &field,
            &model.dependency_name(dependency.kind),
            MAX_STATEFULSET_NAME_LEN,
        )?;
        // Services and the dependency share the `<app>-<x>` namespace.
        if model.topology == Topology::Multi && model.service(dependency.kind.as_str()).is_some() {
            return Err(KilnError::invalid(
                "services",
                format!("service name '{}' collides with a dependency", dependency.kind),
            ));
        }
    }
    Ok(())
}

fn validate_ingress(model: &AppModel) -> Result<()> {
    let mut hosts = BTreeSet::new();
    let mut object_names: BTreeMap<String, &str> = BTreeMap::new();
    for rule in &model.ingress {
        let field = format!("ingress[{}]", rule.host);
        match url::Host::parse(&rule.host) {
            Ok(url::Host::Domain(domain)) if domain == rule.host => {}
            _ => {
                return Err(KilnError::invalid(
                    format!("{field}.host"),
                    format!("'{}' is not a valid host name", rule.host),
                ));
            }
        }
        if !hosts.insert(rule.host.as_str()) {
            return Err(KilnError::invalid(
                "ingress",
                format!("host '{}' is declared more than once", rule.host),
            ));
        }
        let name = model.ingress_name(&rule.host);
        check_derived_name(&format!("{field}.host"), &name, MAX_NAME_LEN)?;
        if let Some(other) = object_names.insert(name, &rule.host) {
            return Err(KilnError::invalid(
                format!("{field}.host"),
                format!("'{}' maps to the same object name as '{}'", rule.host, other),
            ));
        }
        if !rule.path.starts_with('/') {
            return Err(KilnError::invalid(
                format!("{field}.path"),
                format!("'{}' must start with '/'", rule.path),
            ));
        }
        if let Some(service) = &rule.service {
            if model.service(service).is_none() {
                return Err(KilnError::invalid(
                    format!("{field}.service"),
                    format!("unknown service '{}'", service),
                ));
            }
        }
        if let Some(secret) = &rule.tls_secret {
            check_dns_label(&format!("{field}.tlsSecret"), secret)?;
        }
    }
    Ok(())
}

fn validate_volumes(model: &AppModel) -> Result<()> {
    let mut names = BTreeSet::new();
    for volume in &model.volumes {
        let field = format!("volumes[{}]", volume.name);
        check_dns_label(&format!("{field}.name"), &volume.name)?;
        if !names.insert(volume.name.as_str()) {
            return Err(KilnError::invalid(
                "volumes",
                format!("volume '{}' is declared more than once", volume.name),
            ));
        }
        check_derived_name(
            &format!("{field}.name"),
            &model.volume_claim_name(&volume.name),
            MAX_NAME_LEN,
        )?;
        parse_field(&format!("{field}.size"), Some(&volume.size))?;
        if !volume.mount_path.starts_with('/') {
            return Err(KilnError::invalid(
                format!("{field}.mountPath"),
                format!("'{}' must be an absolute path", volume.mount_path),
            ));
        }
        match (&volume.service, model.topology) {
            (Some(service), _) if model.service(service).is_none() => {
                return Err(KilnError::invalid(
                    format!("{field}.service"),
                    format!("unknown service '{}'", service),
                ));
            }
            (None, Topology::Multi) => {
                return Err(KilnError::invalid(
                    format!("{field}.service"),
                    "multi-service apps must name the service that mounts the volume",
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_jobs(model: &AppModel) -> Result<()> {
    let mut names = BTreeSet::new();
    for job in &model.jobs {
        let field = format!("jobs[{}]", job.name);
        check_dns_label(&format!("{field}.name"), &job.name)?;
        if !names.insert(job.name.as_str()) {
            return Err(KilnError::invalid(
                "jobs",
                format!("job '{}' is declared more than once", job.name),
            ));
        }
        // Jobs are named `<app>-<job>-<hash8>` and the name lands in pod labels.
        let job_name_len = model.name.len() + job.name.len() + 10;
        if job.schedule.is_none() && job_name_len > MAX_NAME_LEN {
            return Err(KilnError::invalid(
                format!("{field}.name"),
                format!("derived job name would exceed {} characters", MAX_NAME_LEN),
            ));
        }
        if job.command.is_empty() {
            return Err(KilnError::invalid(format!("{field}.command"), "command is required"));
        }
        if let Some(schedule) = &job.schedule {
            if !is_cron_schedule(schedule) {
                return Err(KilnError::invalid(
                    format!("{field}.schedule"),
                    format!("'{}' is not a cron schedule", schedule),
                ));
            }
        }
    }
    Ok(())
}

/// Five whitespace-separated fields, or one of the `@` macros.
fn is_cron_schedule(schedule: &str) -> bool {
    const MACROS: [&str; 7] = [
        "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
    ];
    if MACROS.contains(&schedule) {
        return true;
    }
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    fields.len() == 5
        && fields.iter().all(|f| {
            f.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | '?'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("shop"));
        assert!(is_dns_label("shop-2"));
        assert!(!is_dns_label("Shop"));
        assert!(!is_dns_label("-shop"));
        assert!(!is_dns_label("shop-"));
        assert!(!is_dns_label("shop_api"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label(&"a".repeat(64)));
    }

    #[test]
    fn env_names() {
        assert!(is_env_name("DATABASE_URL"));
        assert!(is_env_name("_private"));
        assert!(!is_env_name("1PASSWORD"));
        assert!(!is_env_name("MY-VAR"));
        assert!(!is_env_name(""));
    }

    #[test]
    fn cron_schedules() {
        assert!(is_cron_schedule("*/5 * * * *"));
        assert!(is_cron_schedule("0 3 * * MON-FRI"));
        assert!(is_cron_schedule("@daily"));
        assert!(!is_cron_schedule("every day"));
        assert!(!is_cron_schedule("* * * *"));
    }

    #[test]
    fn cycle_lists_edges_in_order() {
        let services = vec![
            ServiceModel::new("a", "img", 80).depends_on("b"),
            ServiceModel::new("b", "img", 80).depends_on("c"),
            ServiceModel::new("c", "img", 80).depends_on("a"),
        ];
        let cycle = find_cycle(&services).expect("cycle should be found");
        assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let services = vec![
            ServiceModel::new("web", "img", 80).depends_on("api").depends_on("auth"),
            ServiceModel::new("api", "img", 80).depends_on("db"),
            ServiceModel::new("auth", "img", 80).depends_on("db"),
            ServiceModel::new("db", "img", 80),
        ];
        assert!(find_cycle(&services).is_none());
    }
}
