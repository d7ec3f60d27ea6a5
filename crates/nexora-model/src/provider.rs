// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{
    catalog::{self, ModelCatalogEntry},
    CompletionRequest, ResponseEvent,
};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for catalog lookups and status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Catalog entry for this provider/model combination, with a conservative
    /// fallback for models the bundled catalog does not know.
    fn catalog_entry(&self) -> ModelCatalogEntry {
        catalog::lookup(self.name(), self.model_name())
            .unwrap_or_else(|| ModelCatalogEntry::unknown(self.name(), self.model_name()))
    }

    /// Context window size for this provider/model combination.
    fn context_window(&self) -> u32 {
        self.catalog_entry().context_window
    }

    /// Maximum output tokens for this provider/model combination.
    fn max_output_tokens(&self) -> u32 {
        self.catalog_entry().max_output_tokens
    }

    /// Returns `true` if this model advertises image input support.
    fn supports_images(&self) -> bool {
        self.catalog_entry().supports_images
    }
}
