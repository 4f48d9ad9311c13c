//! Plugin chains for topic endpoints.
//!
//! A chain is a flat ordered list. At dispatch it is filtered by
//! [`PluginKind`] and each stage feeds its output to the next. A stage that
//! returns `None` drops the message and ends the chain.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::endpoint::{EndpointId, RouteTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Receive,
    Send,
}

/// One message transformer.
pub trait Plugin: Send + Sync + 'static {
    fn kind(&self) -> PluginKind;

    /// Transform `message`, or return `None` to drop it.
    fn apply(&self, message: Value) -> Option<Value>;

    /// Plugin name for debugging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once when the owning endpoint activates.
    fn setup(&self, _endpoint: EndpointId) {}
}

#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<P: Plugin>(&mut self, plugin: P) {
        self.plugins.push(Arc::new(plugin));
    }

    /// Add a plugin the caller keeps a handle to (a [`MessageRoute`] whose
    /// routes change at runtime, for instance).
    pub fn add_shared(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Names of the stages of one kind, in order.
    pub fn names(&self, kind: PluginKind) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|p| p.kind() == kind)
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn setup(&self, endpoint: EndpointId) {
        for plugin in &self.plugins {
            plugin.setup(endpoint);
        }
    }

    /// Run every stage of `kind` over `message`.
    pub fn run(&self, kind: PluginKind, message: Value) -> Option<Value> {
        let mut message = message;
        for plugin in self.plugins.iter().filter(|p| p.kind() == kind) {
            match plugin.apply(message) {
                Some(next) => message = next,
                None => {
                    debug!("Message dropped by {}", plugin.name());
                    return None;
                }
            }
        }
        Some(message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageRoute
// ─────────────────────────────────────────────────────────────────────────────

/// Callback for a matched route. Receives the whole message.
pub type RouteHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// How a route name is compared with the message attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMatch {
    #[default]
    Exact,
    Prefix,
}

struct Route {
    name: String,
    key: String,
    handler: RouteHandler,
}

/// Receive-side router: fires callbacks for messages whose attribute matches a
/// route name, and always forwards the message unchanged.
#[derive(Default)]
pub struct MessageRoute {
    policy: RouteMatch,
    routes: RwLock<Vec<Route>>,
}

impl MessageRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_match(policy: RouteMatch) -> Self {
        Self {
            policy,
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Route messages whose `key` attribute matches `route` to `handler`.
    /// Re-registering a route replaces it in place.
    pub fn on(
        &self,
        key: impl Into<String>,
        route: impl Into<String>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        let route = Route {
            name: route.into(),
            key: key.into(),
            handler: Arc::new(handler),
        };
        let mut routes = self.routes.write();
        match routes.iter_mut().find(|r| r.name == route.name) {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
    }

    fn matches(&self, route: &str, value: &str) -> bool {
        match self.policy {
            RouteMatch::Exact => value == route,
            RouteMatch::Prefix => value.starts_with(route),
        }
    }
}

impl RouteTable for MessageRoute {
    fn drop_route(&self, route: &str) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.name != route);
        routes.len() != before
    }

    fn routes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().iter().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }
}

impl Plugin for MessageRoute {
    fn kind(&self) -> PluginKind {
        PluginKind::Receive
    }

    fn apply(&self, message: Value) -> Option<Value> {
        let matched: Vec<RouteHandler> = self
            .routes
            .read()
            .iter()
            .filter(|route| {
                message
                    .get(&route.key)
                    .and_then(Value::as_str)
                    .is_some_and(|value| self.matches(&route.name, value))
            })
            .map(|route| route.handler.clone())
            .collect();

        for handler in matched {
            handler(&message);
        }
        Some(message)
    }

    fn name(&self) -> &str {
        "MessageRoute"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in stages
// ─────────────────────────────────────────────────────────────────────────────

/// Keep only frame `index` of a framed message.
#[derive(Debug, Clone, Copy)]
pub struct FrameSelect {
    pub index: usize,
}

impl Plugin for FrameSelect {
    fn kind(&self) -> PluginKind {
        PluginKind::Receive
    }

    fn apply(&self, message: Value) -> Option<Value> {
        match message {
            Value::Array(mut frames) if self.index < frames.len() => {
                Some(frames.swap_remove(self.index))
            }
            _ => {
                trace!("No frame {} in message", self.index);
                None
            }
        }
    }

    fn name(&self) -> &str {
        "FrameSelect"
    }
}

/// Parse a string payload as JSON. Noise around the outermost object is
/// ignored; anything unparseable is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecode;

impl Plugin for JsonDecode {
    fn kind(&self) -> PluginKind {
        PluginKind::Receive
    }

    fn apply(&self, message: Value) -> Option<Value> {
        let text = match message {
            Value::String(text) => text,
            Value::Object(_) | Value::Array(_) => return Some(message),
            _ => return None,
        };
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end < start {
            return None;
        }
        match serde_json::from_str(&text[start..=end]) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Malformed JSON payload: {e}");
                None
            }
        }
    }

    fn name(&self) -> &str {
        "JsonDecode"
    }
}

/// Frame an object as `[topic, "", json]`, taking the topic from
/// `topic_key`.
#[derive(Debug, Clone)]
pub struct TopicEnvelope {
    pub topic_key: String,
}

impl TopicEnvelope {
    pub fn new(topic_key: impl Into<String>) -> Self {
        Self {
            topic_key: topic_key.into(),
        }
    }
}

impl Plugin for TopicEnvelope {
    fn kind(&self) -> PluginKind {
        PluginKind::Send
    }

    fn apply(&self, message: Value) -> Option<Value> {
        let topic = message.get(&self.topic_key)?.as_str()?.to_string();
        Some(json!([topic, "", message.to_string()]))
    }

    fn name(&self) -> &str {
        "TopicEnvelope"
    }
}

type StageFn = Box<dyn Fn(Value) -> Option<Value> + Send + Sync>;

/// A closure as a plugin.
pub struct FnPlugin {
    kind: PluginKind,
    name: String,
    stage: StageFn,
}

impl FnPlugin {
    pub fn new(
        kind: PluginKind,
        name: impl Into<String>,
        stage: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            stage: Box::new(stage),
        }
    }

    pub fn receive(
        name: impl Into<String>,
        stage: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::new(PluginKind::Receive, name, stage)
    }

    pub fn send(
        name: impl Into<String>,
        stage: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::new(PluginKind::Send, name, stage)
    }
}

impl Plugin for FnPlugin {
    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn apply(&self, message: Value) -> Option<Value> {
        (self.stage)(message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
