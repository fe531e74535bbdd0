//! `coursegen-ai`
//!
//! **Responsibility:** AI provider boundary for course generation.
//!
//! - `AiProvider` is the capability object the job processors call.
//! - `ProviderGateway` binds a capability to one tenant's decrypted API key.
//!   Bindings are built fresh per generation call and never shared across
//!   tenants.
//! - This crate knows nothing about jobs or storage; callers supply inputs and
//!   persist results.

pub mod error;
pub mod gateway;
pub mod http;
pub mod keys;
pub mod provider;

pub use error::AiError;
pub use gateway::{
    ApiKey, ProviderBinding, ProviderFactory, ProviderGateway, TenantCredentials,
    TenantCredentialsSource, TenantKeyGateway,
};
pub use http::{OpenAiCompatibleFactory, OpenAiCompatibleProvider};
pub use keys::KeyCipher;
pub use provider::{
    AiProvider, AudienceProfile, GeneratedComponent, GeneratedLesson, GeneratedSection,
    LessonContentRequest, LessonContentResponse, OutlineRequest, OutlineResponse,
    ProcessContentRequest, ProcessContentResponse,
};
