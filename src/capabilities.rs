//! Client capability construction and server capability interpretation.
//!
//! The capability tree is assembled once per start by every feature and is
//! immutable after the handshake. The other half of this module turns the
//! server's advertised capabilities into static registrations: each provider
//! capability is serialized and merged with the client's default document
//! selector, honoring an embedded `StaticRegistrationOptions` id when the
//! server supplied one.

use std::sync::Arc;

use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability,
    DiagnosticClientCapabilities, DidChangeConfigurationClientCapabilities,
    DidChangeWatchedFilesClientCapabilities, DocumentColorClientCapabilities, GotoCapability,
    HoverClientCapabilities, MarkupKind, PublishDiagnosticsClientCapabilities,
    RenameClientCapabilities, SemanticTokensClientCapabilities,
    SemanticTokensClientCapabilitiesRequests, SemanticTokensFullOptions, ServerCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncKind,
    TextDocumentSyncOptions, TextDocumentSyncSaveOptions, TokenFormat, WorkspaceClientCapabilities,
    WorkspaceEditClientCapabilities,
};
use serde::Serialize;
use serde_json::Value;

use crate::client::Core;
use crate::registry::{DynamicFeature, FeatureRegistration, ProviderFeature};

/// The server's text document sync options, normalized from either the
/// shorthand kind or the full options form.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedTextDocumentSync {
    pub open_close: bool,
    pub change: TextDocumentSyncKind,
    pub will_save: bool,
    pub will_save_wait_until: bool,
    pub save: Option<SaveOptions>,
}

impl Default for ResolvedTextDocumentSync {
    fn default() -> Self {
        ResolvedTextDocumentSync {
            open_close: false,
            change: TextDocumentSyncKind::NONE,
            will_save: false,
            will_save_wait_until: false,
            save: None,
        }
    }
}

/// Normalized save options.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SaveOptions {
    pub include_text: bool,
}

/// Resolves the server's `textDocumentSync` capability.
pub(crate) fn resolve_text_document_sync(
    capability: Option<&TextDocumentSyncCapability>,
) -> ResolvedTextDocumentSync {
    match capability {
        None => ResolvedTextDocumentSync::default(),
        Some(TextDocumentSyncCapability::Kind(kind)) => ResolvedTextDocumentSync {
            open_close: *kind != TextDocumentSyncKind::NONE,
            change: *kind,
            will_save: false,
            will_save_wait_until: false,
            save: if *kind != TextDocumentSyncKind::NONE {
                Some(SaveOptions::default())
            } else {
                None
            },
        },
        Some(TextDocumentSyncCapability::Options(options)) => resolve_sync_options(options),
    }
}

fn resolve_sync_options(options: &TextDocumentSyncOptions) -> ResolvedTextDocumentSync {
    let save = match &options.save {
        None => None,
        Some(TextDocumentSyncSaveOptions::Supported(false)) => None,
        Some(TextDocumentSyncSaveOptions::Supported(true)) => Some(SaveOptions::default()),
        Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => Some(SaveOptions {
            include_text: save.include_text.unwrap_or(false),
        }),
    };

    ResolvedTextDocumentSync {
        open_close: options.open_close.unwrap_or(false),
        change: options.change.unwrap_or(TextDocumentSyncKind::NONE),
        will_save: options.will_save.unwrap_or(false),
        will_save_wait_until: options.will_save_wait_until.unwrap_or(false),
        save,
    }
}

/// Capabilities the client itself guarantees, independent of any feature.
pub(crate) fn fill_base_capabilities(capabilities: &mut ClientCapabilities) {
    let workspace = workspace(capabilities);
    workspace.apply_edit = Some(true);
    workspace.workspace_edit = Some(WorkspaceEditClientCapabilities {
        document_changes: Some(true),
        ..Default::default()
    });
    workspace.configuration = Some(true);
    workspace.workspace_folders = Some(true);
    workspace.did_change_configuration = Some(DidChangeConfigurationClientCapabilities {
        dynamic_registration: Some(true),
    });

    let window = capabilities.window.get_or_insert_with(Default::default);
    window.work_done_progress = Some(true);
    window.show_document = Some(lsp_types::ShowDocumentClientCapabilities { support: true });

    let text_document = text_document(capabilities);
    text_document.publish_diagnostics = Some(PublishDiagnosticsClientCapabilities {
        related_information: Some(true),
        version_support: Some(true),
        data_support: Some(true),
        ..Default::default()
    });
}

fn text_document(capabilities: &mut ClientCapabilities) -> &mut TextDocumentClientCapabilities {
    capabilities.text_document.get_or_insert_with(Default::default)
}

fn workspace(capabilities: &mut ClientCapabilities) -> &mut WorkspaceClientCapabilities {
    capabilities.workspace.get_or_insert_with(Default::default)
}

/// Serializes a provider capability, filtering out "not supported" shapes.
///
/// `true` stays as a bare boolean; `false` and `null` mean the capability is
/// absent; everything else is the provider's options object.
fn provider_value<T: Serialize>(provider: &Option<T>) -> Option<Value> {
    let value = serde_json::to_value(provider.as_ref()?).ok()?;
    match value {
        Value::Bool(false) | Value::Null => None,
        value => Some(value),
    }
}

/// Builds the registration payload for a server capability: bare booleans
/// become empty options, a missing `documentSelector` is filled with the
/// client's default, and a `StaticRegistrationOptions` id is honored.
pub(crate) fn static_registration(core: &Arc<Core>, method: &str, capability: Value) -> FeatureRegistration {
    let mut options = match capability {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Default::default()),
    };

    let id = options
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("static:{method}"));

    merge_default_selector(core, &mut options);

    FeatureRegistration { id, options }
}

/// Inserts the client's default document selector into registration options
/// that carry none.
pub(crate) fn merge_default_selector(core: &Arc<Core>, options: &mut Value) {
    let missing = options
        .get("documentSelector")
        .map(Value::is_null)
        .unwrap_or(true);

    if missing {
        if let Some(default) = core.options.document_selector.as_ref() {
            if let (Value::Object(map), Ok(selector)) =
                (&mut *options, serde_json::to_value(default))
            {
                map.insert("documentSelector".into(), selector);
            }
        }
    }
}

/// The generic request-backed features, one per provider method.
pub(crate) fn provider_features() -> Vec<Arc<dyn DynamicFeature>> {
    vec![
        ProviderFeature::new(
            "textDocument/completion",
            true,
            |caps| {
                text_document(caps).completion = Some(CompletionClientCapabilities {
                    dynamic_registration: Some(true),
                    context_support: Some(true),
                    completion_item: Some(CompletionItemCapability {
                        snippet_support: Some(true),
                        documentation_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            },
            |caps| provider_value(&caps.completion_provider),
        ),
        ProviderFeature::new(
            "textDocument/hover",
            true,
            |caps| {
                text_document(caps).hover = Some(HoverClientCapabilities {
                    dynamic_registration: Some(true),
                    content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                });
            },
            |caps| provider_value(&caps.hover_provider),
        ),
        ProviderFeature::new(
            "textDocument/signatureHelp",
            true,
            |caps| {
                text_document(caps).signature_help = Some(lsp_types::SignatureHelpClientCapabilities {
                    dynamic_registration: Some(true),
                    context_support: Some(true),
                    ..Default::default()
                });
            },
            |caps| provider_value(&caps.signature_help_provider),
        ),
        ProviderFeature::new(
            "textDocument/declaration",
            true,
            |caps| {
                text_document(caps).declaration = Some(GotoCapability {
                    dynamic_registration: Some(true),
                    link_support: Some(true),
                });
            },
            |caps| provider_value(&caps.declaration_provider),
        ),
        ProviderFeature::new(
            "textDocument/definition",
            true,
            |caps| {
                text_document(caps).definition = Some(GotoCapability {
                    dynamic_registration: Some(true),
                    link_support: Some(true),
                });
            },
            |caps| provider_value(&caps.definition_provider),
        ),
        ProviderFeature::new(
            "textDocument/typeDefinition",
            true,
            |caps| {
                text_document(caps).type_definition = Some(GotoCapability {
                    dynamic_registration: Some(true),
                    link_support: Some(true),
                });
            },
            |caps| provider_value(&caps.type_definition_provider),
        ),
        ProviderFeature::new(
            "textDocument/implementation",
            true,
            |caps| {
                text_document(caps).implementation = Some(GotoCapability {
                    dynamic_registration: Some(true),
                    link_support: Some(true),
                });
            },
            |caps| provider_value(&caps.implementation_provider),
        ),
        ProviderFeature::new(
            "textDocument/references",
            true,
            |caps| {
                text_document(caps).references = Some(lsp_types::ReferenceClientCapabilities {
                    dynamic_registration: Some(true),
                });
            },
            |caps| provider_value(&caps.references_provider),
        ),
        ProviderFeature::new(
            "textDocument/documentHighlight",
            true,
            |caps| {
                text_document(caps).document_highlight =
                    Some(lsp_types::DocumentHighlightClientCapabilities {
                        dynamic_registration: Some(true),
                    });
            },
            |caps| provider_value(&caps.document_highlight_provider),
        ),
        ProviderFeature::new(
            "textDocument/documentSymbol",
            true,
            |caps| {
                text_document(caps).document_symbol =
                    Some(lsp_types::DocumentSymbolClientCapabilities {
                        dynamic_registration: Some(true),
                        hierarchical_document_symbol_support: Some(true),
                        ..Default::default()
                    });
            },
            |caps| provider_value(&caps.document_symbol_provider),
        ),
        ProviderFeature::new(
            "textDocument/codeAction",
            true,
            |caps| {
                text_document(caps).code_action = Some(lsp_types::CodeActionClientCapabilities {
                    dynamic_registration: Some(true),
                    is_preferred_support: Some(true),
                    data_support: Some(true),
                    resolve_support: Some(lsp_types::CodeActionCapabilityResolveSupport {
                        properties: vec!["edit".into()],
                    }),
                    ..Default::default()
                });
            },
            |caps| provider_value(&caps.code_action_provider),
        ),
        ProviderFeature::new(
            "textDocument/codeLens",
            true,
            |caps| {
                text_document(caps).code_lens = Some(lsp_types::CodeLensClientCapabilities {
                    dynamic_registration: Some(true),
                });

                workspace(caps).code_lens = Some(lsp_types::CodeLensWorkspaceClientCapabilities {
                    refresh_support: Some(true),
                });
            },
            |caps| provider_value(&caps.code_lens_provider),
        ),
        ProviderFeature::new(
            "textDocument/documentLink",
            true,
            |caps| {
                text_document(caps).document_link = Some(lsp_types::DocumentLinkClientCapabilities {
                    dynamic_registration: Some(true),
                    tooltip_support: Some(true),
                });
            },
            |caps| provider_value(&caps.document_link_provider),
        ),
        ProviderFeature::new(
            "textDocument/documentColor",
            true,
            |caps| {
                text_document(caps).color_provider = Some(DocumentColorClientCapabilities {
                    dynamic_registration: Some(true),
                });
            },
            |caps| provider_value(&caps.color_provider),
        ),
        ProviderFeature::new(
            "textDocument/formatting",
            true,
            |caps| {
                text_document(caps).formatting = Some(lsp_types::DocumentFormattingClientCapabilities {
                    dynamic_registration: Some(true),
                });
            },
            |caps| provider_value(&caps.document_formatting_provider),
        ),
        ProviderFeature::new(
            "textDocument/rangeFormatting",
            true,
            |caps| {
                text_document(caps).range_formatting =
                    Some(lsp_types::DocumentRangeFormattingClientCapabilities {
                        dynamic_registration: Some(true),
                    });
            },
            |caps| provider_value(&caps.document_range_formatting_provider),
        ),
        ProviderFeature::new(
            "textDocument/onTypeFormatting",
            true,
            |caps| {
                text_document(caps).on_type_formatting =
                    Some(lsp_types::DocumentOnTypeFormattingClientCapabilities {
                        dynamic_registration: Some(true),
                    });
            },
            |caps| provider_value(&caps.document_on_type_formatting_provider),
        ),
        ProviderFeature::new(
            "textDocument/rename",
            true,
            |caps| {
                text_document(caps).rename = Some(RenameClientCapabilities {
                    dynamic_registration: Some(true),
                    prepare_support: Some(true),
                    ..Default::default()
                });
            },
            |caps| provider_value(&caps.rename_provider),
        ),
        ProviderFeature::new(
            "textDocument/foldingRange",
            true,
            |caps| {
                text_document(caps).folding_range = Some(lsp_types::FoldingRangeClientCapabilities {
                    dynamic_registration: Some(true),
                    line_folding_only: Some(false),
                    ..Default::default()
                });
            },
            |caps| provider_value(&caps.folding_range_provider),
        ),
        ProviderFeature::new(
            "textDocument/selectionRange",
            true,
            |caps| {
                text_document(caps).selection_range =
                    Some(lsp_types::SelectionRangeClientCapabilities {
                        dynamic_registration: Some(true),
                    });
            },
            |caps| provider_value(&caps.selection_range_provider),
        ),
        ProviderFeature::new(
            "textDocument/semanticTokens",
            true,
            |caps| {
                text_document(caps).semantic_tokens = Some(SemanticTokensClientCapabilities {
                    dynamic_registration: Some(true),
                    requests: SemanticTokensClientCapabilitiesRequests {
                        range: Some(true),
                        full: Some(SemanticTokensFullOptions::Delta { delta: Some(true) }),
                    },
                    formats: vec![TokenFormat::RELATIVE],
                    ..Default::default()
                });

                workspace(caps).semantic_tokens =
                    Some(lsp_types::SemanticTokensWorkspaceClientCapabilities {
                        refresh_support: Some(true),
                    });
            },
            |caps| provider_value(&caps.semantic_tokens_provider),
        ),
        ProviderFeature::new(
            "textDocument/linkedEditingRange",
            true,
            |caps| {
                text_document(caps).linked_editing_range =
                    Some(lsp_types::LinkedEditingRangeClientCapabilities {
                        dynamic_registration: Some(true),
                    });
            },
            |caps| provider_value(&caps.linked_editing_range_provider),
        ),
        ProviderFeature::new(
            "textDocument/prepareCallHierarchy",
            true,
            |caps| {
                text_document(caps).call_hierarchy = Some(lsp_types::CallHierarchyClientCapabilities {
                    dynamic_registration: Some(true),
                });
            },
            |caps| provider_value(&caps.call_hierarchy_provider),
        ),
        ProviderFeature::new(
            "textDocument/prepareTypeHierarchy",
            true,
            |caps| {
                text_document(caps).type_hierarchy = Some(lsp_types::TypeHierarchyClientCapabilities {
                    dynamic_registration: Some(true),
                });
            },
            |caps| provider_value(&caps.type_hierarchy_provider),
        ),
        ProviderFeature::new(
            "textDocument/inlayHint",
            true,
            |caps| {
                text_document(caps).inlay_hint = Some(lsp_types::InlayHintClientCapabilities {
                    dynamic_registration: Some(true),
                    ..Default::default()
                });

                workspace(caps).inlay_hint = Some(lsp_types::InlayHintWorkspaceClientCapabilities {
                    refresh_support: Some(true),
                });
            },
            |caps| provider_value(&caps.inlay_hint_provider),
        ),
        ProviderFeature::new(
            "textDocument/inlineValue",
            true,
            |caps| {
                text_document(caps).inline_value = Some(lsp_types::InlineValueClientCapabilities {
                    dynamic_registration: Some(true),
                });

                workspace(caps).inline_value = Some(lsp_types::InlineValueWorkspaceClientCapabilities {
                    refresh_support: Some(true),
                });
            },
            |caps| provider_value(&caps.inline_value_provider),
        ),
        ProviderFeature::new(
            "workspace/symbol",
            false,
            |caps| {
                workspace(caps).symbol = Some(lsp_types::WorkspaceSymbolClientCapabilities {
                    dynamic_registration: Some(true),
                    ..Default::default()
                });
            },
            |caps| provider_value(&caps.workspace_symbol_provider),
        ),
        ProviderFeature::new(
            "workspace/executeCommand",
            false,
            |caps| {
                workspace(caps).execute_command = Some(lsp_types::ExecuteCommandClientCapabilities {
                    dynamic_registration: Some(true),
                });
            },
            |caps| provider_value(&caps.execute_command_provider),
        ),
    ]
}

/// Capability subtree fills shared by the stateful features.
pub(crate) mod fills {
    use super::*;

    pub(crate) fn text_document_sync(caps: &mut ClientCapabilities) {
        text_document(caps).synchronization = Some(lsp_types::TextDocumentSyncClientCapabilities {
            dynamic_registration: Some(true),
            will_save: Some(true),
            will_save_wait_until: Some(true),
            did_save: Some(true),
        });
    }

    pub(crate) fn diagnostics(caps: &mut ClientCapabilities) {
        text_document(caps).diagnostic = Some(DiagnosticClientCapabilities {
            dynamic_registration: Some(true),
            related_document_support: Some(true),
        });

        workspace(caps).diagnostic = Some(lsp_types::DiagnosticWorkspaceClientCapabilities {
            refresh_support: Some(true),
        });
    }

    pub(crate) fn watched_files(caps: &mut ClientCapabilities) {
        workspace(caps).did_change_watched_files = Some(DidChangeWatchedFilesClientCapabilities {
            dynamic_registration: Some(true),
            relative_pattern_support: Some(true),
        });
    }

    pub(crate) fn file_operations(caps: &mut ClientCapabilities) {
        workspace(caps).file_operations = Some(lsp_types::WorkspaceFileOperationsClientCapabilities {
            dynamic_registration: Some(true),
            did_create: Some(true),
            will_create: Some(true),
            did_rename: Some(true),
            will_rename: Some(true),
            did_delete: Some(true),
            will_delete: Some(true),
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolves_shorthand_sync_kind() {
        let resolved = resolve_text_document_sync(Some(&TextDocumentSyncCapability::Kind(
            TextDocumentSyncKind::INCREMENTAL,
        )));
        assert!(resolved.open_close);
        assert_eq!(resolved.change, TextDocumentSyncKind::INCREMENTAL);
        assert!(!resolved.will_save);
        assert!(resolved.save.is_some());
    }

    #[test]
    fn resolves_none_sync_kind() {
        let resolved = resolve_text_document_sync(None);
        assert!(!resolved.open_close);
        assert_eq!(resolved.change, TextDocumentSyncKind::NONE);
        assert!(resolved.save.is_none());
    }

    #[test]
    fn resolves_sync_options_with_save_text() {
        let options = TextDocumentSyncOptions {
            open_close: Some(true),
            change: Some(TextDocumentSyncKind::FULL),
            will_save: Some(true),
            will_save_wait_until: Some(false),
            save: Some(TextDocumentSyncSaveOptions::SaveOptions(lsp_types::SaveOptions {
                include_text: Some(true),
            })),
        };

        let resolved = resolve_text_document_sync(Some(&TextDocumentSyncCapability::Options(options)));
        assert!(resolved.open_close);
        assert_eq!(resolved.change, TextDocumentSyncKind::FULL);
        assert!(resolved.will_save);
        assert!(!resolved.will_save_wait_until);
        assert!(resolved.save.unwrap().include_text);
    }

    #[test]
    fn provider_value_filters_unsupported() {
        assert_eq!(provider_value::<bool>(&None), None);
        assert_eq!(provider_value(&Some(false)), None);
        assert_eq!(provider_value(&Some(true)), Some(json!(true)));
        assert_eq!(
            provider_value(&Some(json!({"resolveProvider": true}))),
            Some(json!({"resolveProvider": true}))
        );
    }

    #[test]
    fn features_cover_every_provider_method() {
        let features = provider_features();
        let methods: Vec<_> = features.iter().map(|f| f.registration_method()).collect();
        assert!(methods.contains(&"textDocument/hover"));
        assert!(methods.contains(&"textDocument/completion"));
        assert!(methods.contains(&"textDocument/semanticTokens"));
        assert!(methods.contains(&"workspace/symbol"));

        let mut deduped = methods.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), methods.len());
    }
}
