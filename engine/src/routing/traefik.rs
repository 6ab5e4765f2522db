//! Traefik file-provider routing
//!
//! Each service gets `<dynamic dir>/<service>.yml`. Entries owned by the
//! service (`<service>-router-*`, `<service>-service-*`) are replaced
//! wholesale on every apply; anything else in the document is carried over.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_yaml::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::orchestrator::is_valid_service_name;
use crate::routing::{Domain, RoutingChange, RoutingStore, RoutingWriteError};
use crate::utils::sha256_hash;

pub const WEB_ENTRYPOINT: &str = "web";
pub const WEBSECURE_ENTRYPOINT: &str = "websecure";
pub const REDIRECT_MIDDLEWARE: &str = "redirect-to-https";
pub const DEFAULT_CERT_RESOLVER: &str = "letsencrypt";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DynamicConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http: Option<HttpSection>,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HttpSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    routers: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    services: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    middlewares: BTreeMap<String, Value>,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl HttpSection {
    fn is_empty(&self) -> bool {
        self.routers.is_empty()
            && self.services.is_empty()
            && self.middlewares.is_empty()
            && self.other.is_empty()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Router {
    rule: String,
    service: String,
    entry_points: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    middlewares: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<RouterTls>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RouterTls {
    cert_resolver: String,
}

fn router_prefix(service: &str) -> String {
    format!("{}-router-", service)
}

fn service_prefix(service: &str) -> String {
    format!("{}-service-", service)
}

fn owned_by(key: &str, service: &str) -> bool {
    key.starts_with(&router_prefix(service)) || key.starts_with(&service_prefix(service))
}

/// Traefik rule matching a domain
pub fn router_rule(domain: &Domain) -> String {
    let mut rule = format!("Host(`{}`)", domain.host);
    if domain.path != "/" {
        rule.push_str(&format!(" && PathPrefix(`{}`)", domain.path));
    }
    rule
}

fn validate(service: &str, domains: &[Domain]) -> Result<(), RoutingWriteError> {
    let invalid = |message: String| RoutingWriteError::Invalid {
        service: service.to_string(),
        message,
    };
    if !is_valid_service_name(service) {
        return Err(invalid("service name is not usable as a file name".to_string()));
    }
    for domain in domains {
        if domain.host.trim().is_empty() || domain.host.contains(['`', ' ', '/']) {
            return Err(invalid(format!("bad host '{}'", domain.host)));
        }
        if !domain.path.starts_with('/') || domain.path.contains('`') {
            return Err(invalid(format!("bad path '{}'", domain.path)));
        }
        if domain.port == 0 {
            return Err(invalid(format!("domain {} has no port", domain.host)));
        }
    }
    Ok(())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RoutingWriteError> {
    serde_yaml::to_value(value).map_err(RoutingWriteError::Serialize)
}

/// Routers and load-balancer services for one service's domains
fn build_entries(
    service: &str,
    domains: &[Domain],
) -> Result<(BTreeMap<String, Value>, BTreeMap<String, Value>), RoutingWriteError> {
    let mut routers = BTreeMap::new();
    let mut services = BTreeMap::new();

    for (index, domain) in domains.iter().enumerate() {
        let backend = format!("{}{}", service_prefix(service), domain.port);
        services.entry(backend.clone()).or_insert(to_value(&json!({
            "loadBalancer": {
                "servers": [{ "url": format!("http://{}:{}", service, domain.port) }],
                "passHostHeader": true,
            }
        }))?);

        let rule = router_rule(domain);
        if domain.https {
            routers.insert(
                format!("{}{}", router_prefix(service), index),
                to_value(&Router {
                    rule: rule.clone(),
                    service: backend.clone(),
                    entry_points: vec![WEB_ENTRYPOINT.to_string()],
                    middlewares: vec![REDIRECT_MIDDLEWARE.to_string()],
                    tls: None,
                })?,
            );
            routers.insert(
                format!("{}websecure-{}", router_prefix(service), index),
                to_value(&Router {
                    rule,
                    service: backend,
                    entry_points: vec![WEBSECURE_ENTRYPOINT.to_string()],
                    middlewares: domain.middlewares.clone(),
                    tls: Some(RouterTls {
                        cert_resolver: domain
                            .certificate_resolver
                            .clone()
                            .unwrap_or_else(|| DEFAULT_CERT_RESOLVER.to_string()),
                    }),
                })?,
            );
        } else {
            routers.insert(
                format!("{}{}", router_prefix(service), index),
                to_value(&Router {
                    rule,
                    service: backend,
                    entry_points: vec![WEB_ENTRYPOINT.to_string()],
                    middlewares: domain.middlewares.clone(),
                    tls: None,
                })?,
            );
        }
    }

    Ok((routers, services))
}

/// Routing store backed by Traefik's file provider directory
///
/// Writers inside one instance are serialized per file. Separate instances,
/// including other engine processes, each write through their own scratch
/// file, so racing writers on one document end with the last rename winning.
pub struct TraefikFileRouting {
    dynamic_dir: PathBuf,
    writer_tag: String,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl TraefikFileRouting {
    pub fn new(dynamic_dir: impl Into<PathBuf>) -> Self {
        Self {
            dynamic_dir: dynamic_dir.into(),
            writer_tag: Uuid::new_v4().simple().to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dynamic_dir(&self) -> &Path {
        &self.dynamic_dir
    }

    /// Document path for a service
    pub fn config_path(&self, service: &str) -> PathBuf {
        self.dynamic_dir.join(format!("{}.yml", service))
    }

    /// Scratch file this instance stages a service's document in
    pub fn scratch_path(&self, service: &str) -> PathBuf {
        File::new(self.config_path(service)).temp_path(&self.writer_tag)
    }

    fn file_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Read-modify-swap of one document, serialized per file
    async fn rewrite(
        &self,
        service: &str,
        domains: &[Domain],
    ) -> Result<RoutingChange, RoutingWriteError> {
        validate(service, domains)?;
        let path = self.config_path(service);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().await;

        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(RoutingWriteError::Read { path, source }),
        };

        let mut document: DynamicConfig = match &current {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                serde_yaml::from_slice(bytes).map_err(|source| RoutingWriteError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            _ => DynamicConfig::default(),
        };

        let mut http = document.http.take().unwrap_or_default();
        http.routers.retain(|key, _| !owned_by(key, service));
        http.services.retain(|key, _| !owned_by(key, service));
        let (routers, services) = build_entries(service, domains)?;
        http.routers.extend(routers);
        http.services.extend(services);
        if !http.is_empty() {
            document.http = Some(http);
        }

        let file = File::new(&path);
        if document.http.is_none() && document.other.is_empty() {
            if current.is_none() {
                return Ok(RoutingChange::Unchanged);
            }
            file.delete().await.map_err(|e| RoutingWriteError::Write {
                path: path.clone(),
                message: e.to_string(),
            })?;
            info!("Routing config for {} removed", service);
            return Ok(RoutingChange::Written);
        }

        let rendered = serde_yaml::to_string(&document).map_err(RoutingWriteError::Serialize)?;
        if let Some(bytes) = &current {
            if sha256_hash(bytes) == sha256_hash(rendered.as_bytes()) {
                debug!("Routing config for {} unchanged", service);
                return Ok(RoutingChange::Unchanged);
            }
        }

        file.write_atomic_tagged(&self.writer_tag, rendered.as_bytes())
            .await
            .map_err(|e| RoutingWriteError::Write {
                path: path.clone(),
                message: e.to_string(),
            })?;
        info!(
            "Routing config for {} written ({} domains)",
            service,
            domains.len()
        );
        Ok(RoutingChange::Written)
    }
}

#[async_trait]
impl RoutingStore for TraefikFileRouting {
    async fn apply(
        &self,
        service: &str,
        domains: &[Domain],
    ) -> Result<RoutingChange, RoutingWriteError> {
        self.rewrite(service, domains).await
    }

    async fn remove(&self, service: &str) -> Result<RoutingChange, RoutingWriteError> {
        self.rewrite(service, &[]).await
    }
}

/// Options for the static Traefik documents written at setup
#[derive(Debug, Clone)]
pub struct TraefikDefaults {
    /// Dynamic config dir as seen from inside the Traefik container
    pub container_dynamic_dir: String,

    /// ACME account email, no resolver is configured when absent
    pub acme_email: Option<String>,
}

/// Static `traefik.yml` document
pub fn static_config(defaults: &TraefikDefaults) -> Result<String, EngineError> {
    let mut config = json!({
        "providers": {
            "swarm": { "exposedByDefault": false, "watch": true },
            "file": { "directory": defaults.container_dynamic_dir, "watch": true },
        },
        "entryPoints": {
            WEB_ENTRYPOINT: { "address": ":80" },
            WEBSECURE_ENTRYPOINT: { "address": ":443" },
        },
        "api": { "insecure": true },
    });
    if let Some(email) = &defaults.acme_email {
        config["certificatesResolvers"] = json!({
            DEFAULT_CERT_RESOLVER: {
                "acme": {
                    "email": email,
                    "storage": format!("{}/acme.json", defaults.container_dynamic_dir),
                    "httpChallenge": { "entryPoint": WEB_ENTRYPOINT },
                }
            }
        });
    }
    Ok(serde_yaml::to_string(&config)?)
}

/// Shared middlewares document
pub fn middlewares_config() -> Result<String, EngineError> {
    let config = json!({
        "http": {
            "middlewares": {
                REDIRECT_MIDDLEWARE: {
                    "redirectScheme": { "scheme": "https", "permanent": true }
                }
            }
        }
    });
    Ok(serde_yaml::to_string(&config)?)
}

/// Write `traefik.yml` and `dynamic/middlewares.yml` under `base` unless
/// they already exist. Returns the files written.
pub async fn write_default_config(
    base: &Dir,
    defaults: &TraefikDefaults,
) -> Result<Vec<PathBuf>, EngineError> {
    let mut written = Vec::new();
    let documents = [
        (base.file("traefik.yml"), static_config(defaults)?),
        (
            base.subdir("dynamic").file("middlewares.yml"),
            middlewares_config()?,
        ),
    ];
    for (file, contents) in documents {
        if file.exists().await {
            debug!("Keeping existing {}", file.path().display());
            continue;
        }
        file.write_atomic(contents.as_bytes()).await?;
        written.push(file.path().to_path_buf());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn https_domain() -> Domain {
        Domain {
            host: "app.example.com".to_string(),
            path: "/api".to_string(),
            port: 3000,
            https: true,
            certificate_resolver: None,
            middlewares: vec!["compress".to_string()],
        }
    }

    #[test]
    fn test_router_rule() {
        assert_eq!(
            router_rule(&Domain::new("example.com", 80)),
            "Host(`example.com`)"
        );
        assert_eq!(
            router_rule(&https_domain()),
            "Host(`app.example.com`) && PathPrefix(`/api`)"
        );
    }

    #[tokio::test]
    async fn test_apply_writes_routers_and_service() {
        let dir = tempfile::tempdir().unwrap();
        let routing = TraefikFileRouting::new(dir.path());

        let change = routing.apply("web", &[https_domain()]).await.unwrap();
        assert_eq!(change, RoutingChange::Written);

        let text = std::fs::read_to_string(routing.config_path("web")).unwrap();
        let doc: Value = serde_yaml::from_str(&text).unwrap();
        let routers = &doc["http"]["routers"];
        assert_eq!(routers["web-router-0"]["entryPoints"][0], "web");
        assert_eq!(routers["web-router-0"]["middlewares"][0], REDIRECT_MIDDLEWARE);
        assert_eq!(
            routers["web-router-websecure-0"]["tls"]["certResolver"],
            DEFAULT_CERT_RESOLVER
        );
        assert_eq!(
            doc["http"]["services"]["web-service-3000"]["loadBalancer"]["servers"][0]["url"],
            "http://web:3000"
        );
    }

    #[tokio::test]
    async fn test_identical_apply_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let routing = TraefikFileRouting::new(dir.path());
        let domains = [Domain::new("example.com", 80)];

        routing.apply("web", &domains).await.unwrap();
        assert_eq!(
            routing.apply("web", &domains).await.unwrap(),
            RoutingChange::Unchanged
        );
    }

    #[tokio::test]
    async fn test_foreign_entries_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let routing = TraefikFileRouting::new(dir.path());
        std::fs::write(
            routing.config_path("web"),
            "http:\n  middlewares:\n    auth:\n      basicAuth:\n        users: [\"u:p\"]\n  routers:\n    manual-router:\n      rule: Host(`manual.test`)\n      service: manual\n    web-router-7:\n      rule: Host(`stale.test`)\n      service: web-service-80\n",
        )
        .unwrap();

        routing
            .apply("web", &[Domain::new("example.com", 80)])
            .await
            .unwrap();

        let doc: Value =
            serde_yaml::from_str(&std::fs::read_to_string(routing.config_path("web")).unwrap())
                .unwrap();
        assert!(doc["http"]["routers"]["manual-router"].is_mapping());
        assert!(doc["http"]["routers"]["web-router-7"].is_null());
        assert!(doc["http"]["routers"]["web-router-0"].is_mapping());
        assert!(doc["http"]["middlewares"]["auth"].is_mapping());
    }

    #[tokio::test]
    async fn test_remove_deletes_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let routing = TraefikFileRouting::new(dir.path());
        routing
            .apply("web", &[Domain::new("example.com", 80)])
            .await
            .unwrap();

        assert_eq!(routing.remove("web").await.unwrap(), RoutingChange::Written);
        assert!(!routing.config_path("web").exists());
        assert_eq!(routing.remove("web").await.unwrap(), RoutingChange::Unchanged);
    }

    #[tokio::test]
    async fn test_invalid_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let routing = TraefikFileRouting::new(dir.path());
        let err = routing
            .apply("web", &[Domain::new("evil`) || Host(`x", 80)])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingWriteError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_service_name_must_be_a_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let routing = TraefikFileRouting::new(dir.path());
        let err = routing
            .apply("../web", &[Domain::new("web.example.com", 80)])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingWriteError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_racing_writers_last_rename_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(TraefikFileRouting::new(dir.path()));
        let second = Arc::new(TraefikFileRouting::new(dir.path()));
        assert_ne!(first.scratch_path("web"), second.scratch_path("web"));

        let domains = |prefix: &str| -> Vec<Domain> {
            (0..200)
                .map(|i| Domain::new(format!("{}-{}.example.com", prefix, i), 80))
                .collect()
        };
        let (a, b) = (domains("a"), domains("b"));

        for _ in 0..25 {
            let (r1, r2) = (first.clone(), second.clone());
            let (d1, d2) = (a.clone(), b.clone());
            let one = tokio::spawn(async move { r1.apply("web", &d1).await });
            let two = tokio::spawn(async move { r2.apply("web", &d2).await });
            one.await.unwrap().unwrap();
            two.await.unwrap().unwrap();

            let doc: DynamicConfig =
                serde_yaml::from_slice(&std::fs::read(first.config_path("web")).unwrap()).unwrap();
            assert_eq!(doc.http.unwrap().routers.len(), 200);
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("web.yml")]);
    }

    #[tokio::test]
    async fn test_default_config_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let base = Dir::new(dir.path());
        let defaults = TraefikDefaults {
            container_dynamic_dir: "/etc/empaas/traefik/dynamic".to_string(),
            acme_email: Some("ops@example.com".to_string()),
        };

        let written = write_default_config(&base, &defaults).await.unwrap();
        assert_eq!(written.len(), 2);
        assert!(write_default_config(&base, &defaults).await.unwrap().is_empty());

        let doc: Value = serde_yaml::from_str(
            &std::fs::read_to_string(dir.path().join("traefik.yml")).unwrap(),
        )
        .unwrap();
        assert_eq!(doc["entryPoints"]["websecure"]["address"], ":443");
        assert_eq!(
            doc["certificatesResolvers"]["letsencrypt"]["acme"]["email"],
            "ops@example.com"
        );
    }
}
