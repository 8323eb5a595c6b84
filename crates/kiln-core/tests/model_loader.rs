//! Loading `kiln.yaml` app definitions.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use kiln_core::error::KilnError;
use kiln_core::model::{DependencyKind, Topology, load_model, parse_model_str};

const APP: &str = r#"
apiVersion: kiln.dev/v1
kind: App
metadata:
  name: blog
  namespace: web
spec:
  image: ghost:5
  port: 2368
  replicas: 2
  health:
    path: /healthz
  resources:
    requests:
      cpu: 100m
      memory: 128Mi
    limits:
      memory: 256Mi
  env:
    NODE_ENV: production
  secrets:
    literal:
      ADMIN_TOKEN: s3cret
    envFile: secrets/prod.env
  dependencies:
    - type: mysql
      version: "8.0"
  ingress:
    - host: blog.example.com
      tlsSecret: blog-tls
  environments:
    staging:
      namespace: web-staging
      replicas: 1
      env:
        NODE_ENV: staging
        DEBUG: "1"
"#;

const STACK: &str = r#"
apiVersion: kiln.dev/v1
kind: Stack
metadata:
  name: shop
spec:
  env:
    REGION: eu
  services:
    - name: web
      image: shop/web:1
      port: 3000
      dependsOn: [api]
    - name: api
      image: shop/api:1
      port: 9000
      replicas: 3
      env:
        WORKERS: 4
  volumes:
    - name: uploads
      size: 10Gi
      mountPath: /srv/uploads
      service: api
  jobs:
    - name: migrate
      command: ["./migrate"]
  environments:
    prod:
      services:
        api:
          image: shop/api:2
          replicas: 6
"#;

#[test]
fn app_document_normalizes_to_single_topology() {
    let model = parse_model_str(APP, Path::new("/srv/blog"), None).unwrap();

    assert_eq!(model.name, "blog");
    assert_eq!(model.namespace, "web");
    assert_eq!(model.topology, Topology::Single);
    assert_eq!(model.services.len(), 1);

    let service = &model.services[0];
    assert_eq!(service.name, "blog");
    assert_eq!(service.image, "ghost:5");
    assert_eq!(service.port, 2368);
    assert_eq!(service.replicas, 2);
    assert_eq!(service.health_path.as_deref(), Some("/healthz"));
    let resources = service.resources.as_ref().unwrap();
    assert_eq!(resources.requests.cpu.as_deref(), Some("100m"));
    assert_eq!(resources.limits.memory.as_deref(), Some("256Mi"));

    assert_eq!(model.env[0].name, "NODE_ENV");
    assert_eq!(model.secrets.literal["ADMIN_TOKEN"], "s3cret");
    assert_eq!(
        model.secrets.env_file.as_deref(),
        Some(Path::new("/srv/blog/secrets/prod.env"))
    );
    assert_eq!(model.dependencies[0].kind, DependencyKind::Mysql);
    assert_eq!(model.dependencies[0].version.as_deref(), Some("8.0"));
    assert_eq!(model.ingress[0].path, "/");
    assert_eq!(model.ingress[0].tls_secret.as_deref(), Some("blog-tls"));
}

#[test]
fn environment_overlay_merges_env_and_overrides_scalars() {
    let model = parse_model_str(APP, Path::new("."), Some("staging")).unwrap();

    assert_eq!(model.namespace, "web-staging");
    assert_eq!(model.services[0].replicas, 1);
    assert_eq!(model.services[0].image, "ghost:5");
    let env: Vec<(&str, &str)> = model
        .env
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_str()))
        .collect();
    assert_eq!(env, vec![("NODE_ENV", "staging"), ("DEBUG", "1")]);
}

#[test]
fn unknown_environment_lists_defined_ones() {
    let err = parse_model_str(APP, Path::new("."), Some("prod")).unwrap_err();
    match err {
        KilnError::InvalidModel { field, reason } => {
            assert_eq!(field, "environments");
            assert!(reason.contains("prod"));
            assert!(reason.contains("staging"));
        }
        other => panic!("expected InvalidModel, got {:?}", other),
    }
}

#[test]
fn stack_document_keeps_service_order_and_overlays() {
    let model = parse_model_str(STACK, Path::new("."), None).unwrap();

    assert_eq!(model.topology, Topology::Multi);
    assert_eq!(model.namespace, "default");
    let names: Vec<&str> = model.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["web", "api"]);
    assert_eq!(model.services[0].depends_on, vec!["api".to_string()]);
    assert_eq!(model.services[1].env[0].value, "4");
    assert_eq!(model.volumes[0].service.as_deref(), Some("api"));
    assert_eq!(model.jobs[0].command, vec!["./migrate".to_string()]);

    let prod = parse_model_str(STACK, Path::new("."), Some("prod")).unwrap();
    assert_eq!(prod.services[1].image, "shop/api:2");
    assert_eq!(prod.services[1].replicas, 6);
    assert_eq!(prod.services[0].image, "shop/web:1");
}

#[test]
fn unknown_fields_are_rejected() {
    let yaml = APP.replace("  port: 2368\n", "  port: 2368\n  replica: 3\n");
    let err = parse_model_str(&yaml, Path::new("."), None).unwrap_err();
    match err {
        KilnError::InvalidModel { field, reason } => {
            assert_eq!(field, "document");
            assert!(reason.contains("replica"));
        }
        other => panic!("expected InvalidModel, got {:?}", other),
    }
}

#[test]
fn wrong_api_version_and_kind() {
    let yaml = APP.replace("kiln.dev/v1", "kiln.dev/v2");
    assert!(matches!(
        parse_model_str(&yaml, Path::new("."), None),
        Err(KilnError::InvalidModel { ref field, .. }) if field == "apiVersion"
    ));

    let yaml = APP.replace("kind: App", "kind: Cluster");
    assert!(matches!(
        parse_model_str(&yaml, Path::new("."), None),
        Err(KilnError::InvalidModel { ref field, .. }) if field == "kind"
    ));
}

#[test]
fn app_cannot_declare_services_and_stack_needs_them() {
    let yaml = APP.replace("kind: App", "kind: Stack");
    assert!(matches!(
        parse_model_str(&yaml, Path::new("."), None),
        Err(KilnError::InvalidModel { ref field, .. }) if field == "spec.image"
    ));

    let yaml = STACK.replace("kind: Stack", "kind: App");
    assert!(matches!(
        parse_model_str(&yaml, Path::new("."), None),
        Err(KilnError::InvalidModel { ref field, .. }) if field == "spec.services"
    ));
}

#[test]
fn load_model_resolves_env_file_next_to_definition() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("kiln.yaml");
    fs::write(&path, APP).unwrap();

    let model = load_model(&path, None).unwrap();
    assert_eq!(
        model.secrets.env_file,
        Some(temp.path().join("secrets/prod.env"))
    );
}

#[test]
fn missing_definition_is_missing_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("kiln.yaml");

    assert_eq!(
        load_model(&path, None).unwrap_err(),
        KilnError::MissingFile { path }
    );
}
