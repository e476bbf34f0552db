//! Feature traits and registration bookkeeping.
//!
//! Every capability the client understands is modeled as a feature: it
//! contributes to the advertised [`ClientCapabilities`], derives a static
//! registration from the server's capabilities after the handshake, and
//! serves dynamic `client/registerCapability` traffic for its method.
//! Features are stored behind trait objects keyed by registration method.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use lsp_types::{ClientCapabilities, DocumentSelector, InitializeParams, ServerCapabilities, Url};
use serde_json::Value;

use crate::capabilities;
use crate::client::Core;
use crate::selector::CompiledSelector;
use crate::{Error, Result};

/// A single dynamic registration dispatched to a feature.
///
/// `options` has already been through selector defaulting: a document-scoped
/// registration that omitted `documentSelector` carries the client's default
/// selector here.
#[derive(Debug)]
pub(crate) struct FeatureRegistration {
    pub id: String,
    pub options: Value,
}

/// A feature that wires once during `initialize` and is disposed on stop.
pub(crate) trait StaticFeature: Send + Sync {
    /// Contributes this feature's client capabilities before the handshake.
    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities);

    /// Amends the `initialize` params, if the feature has anything to add.
    fn fill_initialize_params(&self, _params: &mut InitializeParams) {}

    /// Reacts to the server's capabilities once the handshake completed.
    ///
    /// Features that support static registration derive and apply their
    /// registration payload here.
    fn initialize(&self, core: &Arc<Core>, capabilities: &ServerCapabilities);

    /// Releases every resource the feature holds.
    fn dispose(&self, core: &Arc<Core>);
}

/// A feature that additionally serves dynamic (un)registration.
pub(crate) trait DynamicFeature: StaticFeature {
    /// The method string used in `client/registerCapability` payloads.
    fn registration_method(&self) -> &'static str;

    /// Applies a registration. Re-registering an existing id replaces that
    /// registration in place.
    fn register(&self, core: &Arc<Core>, registration: FeatureRegistration) -> Result<()>;

    /// Removes the registration with the given id, if present.
    fn unregister(&self, core: &Arc<Core>, id: &str);
}

/// The ordered feature list plus method-keyed lookup.
pub(crate) struct FeatureRegistry {
    features: Vec<Arc<dyn DynamicFeature>>,
    by_method: HashMap<&'static str, Arc<dyn DynamicFeature>>,
}

impl FeatureRegistry {
    pub fn new(features: Vec<Arc<dyn DynamicFeature>>) -> Self {
        let by_method = features
            .iter()
            .map(|feature| (feature.registration_method(), feature.clone()))
            .collect();

        FeatureRegistry {
            features,
            by_method,
        }
    }

    pub fn get(&self, method: &str) -> Option<&Arc<dyn DynamicFeature>> {
        self.by_method.get(method)
    }

    pub fn fill_client_capabilities(&self) -> ClientCapabilities {
        let mut capabilities = ClientCapabilities::default();
        for feature in &self.features {
            feature.fill_client_capabilities(&mut capabilities);
        }
        capabilities
    }

    pub fn fill_initialize_params(&self, params: &mut InitializeParams) {
        for feature in &self.features {
            feature.fill_initialize_params(params);
        }
    }

    pub fn initialize(&self, core: &Arc<Core>, capabilities: &ServerCapabilities) {
        for feature in &self.features {
            feature.initialize(core, capabilities);
        }
    }

    pub fn dispose_all(&self, core: &Arc<Core>) {
        for feature in &self.features {
            feature.dispose(core);
        }
    }
}

impl std::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("methods", &self.by_method.keys())
            .finish()
    }
}

/// One applied registration inside a provider table.
pub(crate) struct ProviderEntry {
    /// `None` for workspace-scoped methods, which match any document.
    pub selector: Option<Arc<CompiledSelector>>,
    pub options: Value,
}

/// Insertion-ordered registration tables for every request-backed method.
///
/// Lookup scans a method's registrations in insertion order and returns the
/// first whose selector applies, so earlier registrations win ties.
pub(crate) struct ProviderRegistry {
    tables: DashMap<&'static str, IndexMap<String, ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            tables: DashMap::new(),
        }
    }

    pub fn register(&self, method: &'static str, id: String, entry: ProviderEntry) {
        self.tables.entry(method).or_default().insert(id, entry);
    }

    /// Removes a registration. Returns `true` if it existed.
    pub fn unregister(&self, method: &str, id: &str) -> bool {
        match self.tables.get_mut(method) {
            Some(mut table) => table.shift_remove(id).is_some(),
            None => false,
        }
    }

    /// Returns the id and options of the first registration matching the
    /// given document.
    pub fn first_match(&self, method: &str, uri: &Url, language: Option<&str>) -> Option<(String, Value)> {
        let table = self.tables.get(method)?;
        table
            .iter()
            .find(|(_, entry)| match &entry.selector {
                Some(selector) => selector.matches(uri, language),
                None => true,
            })
            .map(|(id, entry)| (id.clone(), entry.options.clone()))
    }

    /// Returns `true` if any registration for `method` exists.
    pub fn has_any(&self, method: &str) -> bool {
        self.tables
            .get(method)
            .map(|table| !table.is_empty())
            .unwrap_or(false)
    }

    /// Returns every selector currently registered for `method`.
    pub fn selectors(&self, method: &str) -> Vec<Arc<CompiledSelector>> {
        self.tables
            .get(method)
            .map(|table| {
                table
                    .values()
                    .filter_map(|entry| entry.selector.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear_method(&self, method: &str) {
        self.tables.remove(method);
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<_> = self
            .tables
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("tables", &methods)
            .finish()
    }
}

/// Maps a request method to the registration method its provider table is
/// keyed under. Follow-up and resolve requests share their parent feature's
/// registrations.
pub(crate) fn registration_method(request_method: &str) -> &str {
    match request_method {
        "completionItem/resolve" => "textDocument/completion",
        "codeAction/resolve" => "textDocument/codeAction",
        "codeLens/resolve" => "textDocument/codeLens",
        "documentLink/resolve" => "textDocument/documentLink",
        "inlayHint/resolve" => "textDocument/inlayHint",
        "textDocument/semanticTokens/full"
        | "textDocument/semanticTokens/full/delta"
        | "textDocument/semanticTokens/range" => "textDocument/semanticTokens",
        "callHierarchy/incomingCalls" | "callHierarchy/outgoingCalls" => {
            "textDocument/prepareCallHierarchy"
        }
        "typeHierarchy/supertypes" | "typeHierarchy/subtypes" => "textDocument/prepareTypeHierarchy",
        "textDocument/colorPresentation" => "textDocument/documentColor",
        "textDocument/prepareRename" => "textDocument/rename",
        method => method,
    }
}

/// The generic provider feature backing every request-backed method that
/// needs no state beyond its registration table.
pub(crate) struct ProviderFeature {
    method: &'static str,
    document_scoped: bool,
    fill: fn(&mut ClientCapabilities),
    derive: fn(&ServerCapabilities) -> Option<Value>,
}

impl ProviderFeature {
    pub fn new(
        method: &'static str,
        document_scoped: bool,
        fill: fn(&mut ClientCapabilities),
        derive: fn(&ServerCapabilities) -> Option<Value>,
    ) -> Arc<Self> {
        Arc::new(ProviderFeature {
            method,
            document_scoped,
            fill,
            derive,
        })
    }
}

impl StaticFeature for ProviderFeature {
    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        (self.fill)(capabilities);
    }

    fn initialize(&self, core: &Arc<Core>, capabilities: &ServerCapabilities) {
        if let Some(capability) = (self.derive)(capabilities) {
            let registration = capabilities::static_registration(core, self.method, capability);
            if let Err(e) = self.register(core, registration) {
                tracing::error!("static registration for {} failed: {}", self.method, e);
            }
        }
    }

    fn dispose(&self, core: &Arc<Core>) {
        core.providers.clear_method(self.method);
    }
}

impl DynamicFeature for ProviderFeature {
    fn registration_method(&self) -> &'static str {
        self.method
    }

    fn register(&self, core: &Arc<Core>, registration: FeatureRegistration) -> Result<()> {
        let selector = if self.document_scoped {
            Some(Arc::new(parse_selector(self.method, &registration.options)?))
        } else {
            None
        };

        core.providers.register(
            self.method,
            registration.id,
            ProviderEntry {
                selector,
                options: registration.options,
            },
        );
        Ok(())
    }

    fn unregister(&self, core: &Arc<Core>, id: &str) {
        core.providers.unregister(self.method, id);
    }
}

/// Extracts and compiles the `documentSelector` of a registration options
/// object.
pub(crate) fn parse_selector(method: &str, options: &Value) -> Result<CompiledSelector> {
    let selector_value = options.get("documentSelector").cloned().unwrap_or(Value::Null);
    let selector: Option<DocumentSelector> = serde_json::from_value(selector_value)?;

    match selector {
        Some(selector) => CompiledSelector::new(&selector),
        None => Err(Error::Registration(format!(
            "{method} registration carries no document selector and the client has no default"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(selector: Option<&str>) -> ProviderEntry {
        let selector = selector.map(|language| {
            let filters = vec![lsp_types::DocumentFilter {
                language: Some(language.to_owned()),
                scheme: None,
                pattern: None,
            }];
            Arc::new(CompiledSelector::new(&filters).unwrap())
        });

        ProviderEntry {
            selector,
            options: json!({}),
        }
    }

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn first_matching_registration_wins() {
        let providers = ProviderRegistry::new();
        providers.register("textDocument/hover", "a".into(), entry(Some("rust")));
        providers.register("textDocument/hover", "b".into(), entry(Some("rust")));

        let (id, _) = providers
            .first_match("textDocument/hover", &uri("file:///main.rs"), Some("rust"))
            .unwrap();
        assert_eq!(id, "a");
    }

    #[test]
    fn unmatched_document_finds_no_provider() {
        let providers = ProviderRegistry::new();
        providers.register("textDocument/hover", "a".into(), entry(Some("rust")));

        assert!(providers
            .first_match("textDocument/hover", &uri("file:///main.py"), Some("python"))
            .is_none());
    }

    #[test]
    fn reregistration_is_idempotent_per_id() {
        let providers = ProviderRegistry::new();
        providers.register("textDocument/hover", "a".into(), entry(Some("rust")));
        providers.register("textDocument/hover", "b".into(), entry(Some("toml")));
        providers.register("textDocument/hover", "a".into(), entry(Some("rust")));

        // Insertion order is preserved, so "a" still precedes "b".
        let (id, _) = providers
            .first_match("textDocument/hover", &uri("file:///main.rs"), Some("rust"))
            .unwrap();
        assert_eq!(id, "a");

        assert!(providers.unregister("textDocument/hover", "a"));
        assert!(!providers.unregister("textDocument/hover", "a"));
    }

    #[test]
    fn workspace_scoped_entry_matches_everything() {
        let providers = ProviderRegistry::new();
        providers.register("workspace/symbol", "a".into(), entry(None));

        assert!(providers
            .first_match("workspace/symbol", &uri("file:///anything"), None)
            .is_some());
    }

    #[test]
    fn maps_follow_up_methods_to_their_feature() {
        assert_eq!(
            registration_method("completionItem/resolve"),
            "textDocument/completion"
        );
        assert_eq!(
            registration_method("textDocument/semanticTokens/full/delta"),
            "textDocument/semanticTokens"
        );
        assert_eq!(registration_method("textDocument/hover"), "textDocument/hover");
    }
}
