//! Static (bootstrap) and dynamic (hot-reloadable) configuration

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Opaque options mapping handed to plugins, providers, and discovery
/// backends. Ordered keys keep serialization deterministic, which the
/// processor's content hashing depends on.
pub type OptionsMap = BTreeMap<String, serde_yaml::Value>;

/// Bootstrap configuration, immutable after load.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub discovery: Vec<DiscoveryConfig>,

    /// One of "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub name: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub http2: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(rename = "certFile")]
    pub cert_file: String,
    #[serde(rename = "keyFile")]
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub config: OptionsMap,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(rename = "type")]
    pub discovery_type: String,
    #[serde(default)]
    pub config: OptionsMap,
}

/// A dynamic configuration document, pushed by providers and split
/// per-listener by the processor.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Dynamic {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,
    /// L4 routes: parsed and name-checked, otherwise ignored by this proxy.
    #[serde(default, rename = "streamRoute", skip_serializing_if = "Vec::is_empty")]
    pub stream_routes: Vec<StreamRouteConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    pub name: String,
    pub listener: String,
    #[serde(default)]
    pub matches: Vec<MatchConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
}

/// One match condition: a conjunction of the fields that are present.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MatchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub name: String,
    /// Load-balancing policy; defaults to round robin.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DiscoveryRef {
    #[serde(rename = "type")]
    pub discovery_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub plugin_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: OptionsMap,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct StreamRouteConfig {
    pub name: String,
    #[serde(default)]
    pub listener: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
}

impl StaticConfig {
    /// Load and validate the bootstrap file. Any failure here is fatal for
    /// startup.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        let cfg: StaticConfig = serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config YAML {}: {}", path.display(), e))?;
        StaticValidator::new().validate(&cfg)?;
        Ok(cfg)
    }
}

/// A single configuration validation failure, addressed by field path.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "validation error: {}", self.message)
        } else {
            write!(f, "validation error: {}: {}", self.field, self.message)
        }
    }
}

/// All validation failures found in one document.
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "configuration validation failed:")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Validates the bootstrap configuration.
#[derive(Default)]
pub struct StaticValidator {
    errors: Vec<ValidationError>,
}

impl StaticValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, cfg: &StaticConfig) -> Result<(), ValidationErrors> {
        self.validate_listeners(&cfg.listeners);
        self.validate_providers(&cfg.providers);
        self.validate_discovery(&cfg.discovery);
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors))
        }
    }

    fn add(&mut self, field: String, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field,
            message: message.into(),
        });
    }

    fn validate_listeners(&mut self, listeners: &[ListenerConfig]) {
        let mut seen_names = std::collections::HashSet::new();
        let mut seen_ports = std::collections::HashSet::new();

        for (i, listener) in listeners.iter().enumerate() {
            if listener.name.trim().is_empty() {
                self.add(format!("listeners[{i}].name"), "listener name cannot be empty");
            }
            if !seen_names.insert(listener.name.clone()) {
                self.add(
                    format!("listeners[{i}].name"),
                    format!("duplicate listener name: {}", listener.name),
                );
            }
            if listener.port == 0 {
                self.add(
                    format!("listeners[{i}].port"),
                    "invalid port number: 0 (must be between 1-65535)",
                );
            }
            if !seen_ports.insert(listener.port) {
                self.add(
                    format!("listeners[{i}].port"),
                    format!("duplicate port: {}", listener.port),
                );
            }
            if let Some(tls) = &listener.tls {
                if tls.cert_file.trim().is_empty() {
                    self.add(
                        format!("listeners[{i}].tls.certFile"),
                        "TLS certificate file path cannot be empty",
                    );
                }
                if tls.key_file.trim().is_empty() {
                    self.add(
                        format!("listeners[{i}].tls.keyFile"),
                        "TLS key file path cannot be empty",
                    );
                }
            }
        }
    }

    fn validate_providers(&mut self, providers: &[ProviderConfig]) {
        let mut seen = std::collections::HashSet::new();
        for (i, provider) in providers.iter().enumerate() {
            if provider.name.trim().is_empty() {
                self.add(format!("providers[{i}].name"), "provider name cannot be empty");
            }
            if !seen.insert(provider.name.clone()) {
                self.add(
                    format!("providers[{i}].name"),
                    format!("duplicate provider name: {}", provider.name),
                );
            }
            if provider.provider_type.trim().is_empty() {
                self.add(format!("providers[{i}].type"), "provider type cannot be empty");
            }
        }
    }

    fn validate_discovery(&mut self, discovery: &[DiscoveryConfig]) {
        let mut seen = std::collections::HashSet::new();
        for (i, d) in discovery.iter().enumerate() {
            if d.discovery_type.trim().is_empty() {
                self.add(format!("discovery[{i}].type"), "discovery type cannot be empty");
            }
            if !seen.insert(d.discovery_type.clone()) {
                self.add(
                    format!("discovery[{i}].type"),
                    format!("duplicate discovery type: {}", d.discovery_type),
                );
            }
        }
    }
}

const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "CONNECT", "TRACE",
];

/// Validates a dynamic configuration document. Rejection is not fatal: the
/// caller keeps the previously applied document.
#[derive(Default)]
pub struct DynamicValidator {
    errors: Vec<ValidationError>,
}

impl DynamicValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, cfg: &Dynamic) -> Result<(), ValidationErrors> {
        self.validate_unique_names(cfg);
        self.validate_routes(&cfg.routes);
        self.validate_upstreams(&cfg.upstreams);
        self.validate_plugins(&cfg.plugins);
        self.validate_stream_routes(&cfg.stream_routes);
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors))
        }
    }

    fn add(&mut self, field: String, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field,
            message: message.into(),
        });
    }

    fn validate_unique_names(&mut self, cfg: &Dynamic) {
        let mut seen: std::collections::HashMap<String, &'static str> =
            std::collections::HashMap::new();
        let mut check = |seen: &mut std::collections::HashMap<String, &'static str>,
                         errors: &mut Vec<ValidationError>,
                         kind: &'static str,
                         section: &'static str,
                         i: usize,
                         name: &str| {
            if let Some(existing) = seen.get(name) {
                errors.push(ValidationError {
                    field: format!("{section}[{i}].name"),
                    message: format!("duplicate name '{name}' already used by {existing}"),
                });
            } else {
                seen.insert(name.to_string(), kind);
            }
        };

        for (i, route) in cfg.routes.iter().enumerate() {
            check(&mut seen, &mut self.errors, "route", "routes", i, &route.name);
        }
        for (i, upstream) in cfg.upstreams.iter().enumerate() {
            check(&mut seen, &mut self.errors, "upstream", "upstreams", i, &upstream.name);
        }
        for (i, plugin) in cfg.plugins.iter().enumerate() {
            check(&mut seen, &mut self.errors, "plugin", "plugins", i, &plugin.name);
        }
        for (i, sr) in cfg.stream_routes.iter().enumerate() {
            check(&mut seen, &mut self.errors, "streamRoute", "streamRoutes", i, &sr.name);
        }
    }

    fn validate_routes(&mut self, routes: &[RouteConfig]) {
        for (i, route) in routes.iter().enumerate() {
            if route.name.trim().is_empty() {
                self.add(format!("routes[{i}].name"), "route name cannot be empty");
            }
            if route.listener.trim().is_empty() {
                self.add(format!("routes[{i}].listener"), "route listener cannot be empty");
            }
            if route.matches.is_empty() {
                self.add(
                    format!("routes[{i}].matches"),
                    "route must have at least one match condition",
                );
            }
            for (j, m) in route.matches.iter().enumerate() {
                let prefix = format!("routes[{i}].matches[{j}]");
                let path = m.path.as_deref().unwrap_or("");
                let method = m.method.as_deref().unwrap_or("");
                if path.trim().is_empty() && method.trim().is_empty() && m.headers.is_empty() {
                    self.add(
                        prefix.clone(),
                        "match must specify at least one of: path, headers, or method",
                    );
                }
                if !path.is_empty() && !path.starts_with('/') {
                    self.add(format!("{prefix}.path"), "path must start with '/'");
                }
                if !method.is_empty() && !VALID_METHODS.contains(&method.to_uppercase().as_str()) {
                    self.add(format!("{prefix}.method"), format!("invalid HTTP method: {method}"));
                }
            }
            match &route.upstream {
                Some(upstream) => {
                    self.validate_upstream_reference(format!("routes[{i}].upstream"), upstream)
                }
                None => self.add(
                    format!("routes[{i}].upstream"),
                    "route must have an upstream configuration",
                ),
            }
            for (j, plugin) in route.plugins.iter().enumerate() {
                if plugin.name.trim().is_empty() {
                    self.add(
                        format!("routes[{i}].plugins[{j}].name"),
                        "plugin name cannot be empty",
                    );
                }
            }
        }
    }

    fn validate_upstreams(&mut self, upstreams: &[UpstreamConfig]) {
        for (i, upstream) in upstreams.iter().enumerate() {
            if upstream.name.trim().is_empty() {
                self.add(format!("upstreams[{i}].name"), "upstream name cannot be empty");
            }
            self.validate_upstream_config(format!("upstreams[{i}]"), upstream);
        }
    }

    fn validate_upstream_config(&mut self, prefix: String, upstream: &UpstreamConfig) {
        if upstream.discovery.is_some() {
            if upstream.service.trim().is_empty() {
                self.add(
                    format!("{prefix}.service"),
                    "service cannot be empty when discovery is configured",
                );
            }
            return;
        }
        if upstream.nodes.is_empty() {
            self.add(
                format!("{prefix}.nodes"),
                "upstream must have either discovery or static nodes",
            );
        }
        for (j, node) in upstream.nodes.iter().enumerate() {
            self.validate_node(format!("{prefix}.nodes[{j}]"), node);
        }
    }

    /// An upstream attached to a route may be a named reference to the
    /// document's upstream list or a full inline definition.
    fn validate_upstream_reference(&mut self, prefix: String, upstream: &UpstreamConfig) {
        if upstream.name.trim().is_empty()
            && upstream.discovery.is_none()
            && upstream.nodes.is_empty()
        {
            self.add(prefix.clone(), "upstream reference must have either name or discovery");
        }
        if upstream.discovery.is_some() && upstream.service.trim().is_empty() {
            self.add(
                format!("{prefix}.service"),
                "service cannot be empty when discovery is configured",
            );
        }
        for (j, node) in upstream.nodes.iter().enumerate() {
            self.validate_node(format!("{prefix}.nodes[{j}]"), node);
        }
    }

    fn validate_node(&mut self, prefix: String, node: &NodeConfig) {
        if node.url.trim().is_empty() {
            self.add(format!("{prefix}.url"), "node URL cannot be empty");
            return;
        }
        match url::Url::parse(&node.url) {
            Ok(parsed) => {
                if !parsed.has_host() {
                    self.add(format!("{prefix}.url"), "URL must include host");
                }
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.add(
                    format!("{prefix}.url"),
                    "URL must include scheme (http:// or https://)",
                );
            }
            Err(e) => {
                self.add(format!("{prefix}.url"), format!("invalid URL: {e}"));
            }
        }
    }

    fn validate_plugins(&mut self, plugins: &[PluginConfig]) {
        for (i, plugin) in plugins.iter().enumerate() {
            if plugin.name.trim().is_empty() {
                self.add(format!("plugins[{i}].name"), "plugin name cannot be empty");
            }
            if plugin.plugin_type.trim().is_empty() {
                self.add(format!("plugins[{i}].type"), "plugin type cannot be empty");
            }
        }
    }

    fn validate_stream_routes(&mut self, stream_routes: &[StreamRouteConfig]) {
        for (i, sr) in stream_routes.iter().enumerate() {
            if sr.name.trim().is_empty() {
                self.add(format!("streamRoutes[{i}].name"), "stream route name cannot be empty");
            }
            if sr.listener.trim().is_empty() {
                self.add(
                    format!("streamRoutes[{i}].listener"),
                    "stream route listener cannot be empty",
                );
            }
            if let Some(upstream) = &sr.upstream {
                self.validate_upstream_reference(format!("streamRoutes[{i}].upstream"), upstream);
            }
        }
    }
}
