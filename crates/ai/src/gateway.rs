//! Per-tenant provider binding.

use std::sync::Arc;

use tracing::debug;

use coursegen_core::TenantId;

use crate::error::AiError;
use crate::keys::KeyCipher;
use crate::provider::AiProvider;

/// Produces a provider capability for a tenant.
pub trait ProviderGateway: Send + Sync + 'static {
    fn get_provider(&self, tenant_id: TenantId) -> Result<Box<dyn AiProvider>, AiError>;
}

impl<G> ProviderGateway for Arc<G>
where
    G: ProviderGateway + ?Sized,
{
    fn get_provider(&self, tenant_id: TenantId) -> Result<Box<dyn AiProvider>, AiError> {
        (**self).get_provider(tenant_id)
    }
}

/// Decrypted API key. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Ephemeral `{tenant, decrypted key}` binding handed to a factory.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub tenant_id: TenantId,
    pub api_key: ApiKey,
    pub model: Option<String>,
}

/// Tenant AI settings as stored (key still encrypted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCredentials {
    pub encrypted_api_key: Option<String>,
    pub model: Option<String>,
}

/// Where tenant credentials come from (typically the tenant AI settings table).
pub trait TenantCredentialsSource: Send + Sync + 'static {
    fn credentials(&self, tenant_id: TenantId) -> Result<Option<TenantCredentials>, AiError>;
}

/// Builds a concrete provider client from a binding.
pub trait ProviderFactory: Send + Sync + 'static {
    fn build(&self, binding: ProviderBinding) -> Result<Box<dyn AiProvider>, AiError>;
}

/// Gateway that looks up a tenant's encrypted key, decrypts it and hands the
/// binding to a factory.
pub struct TenantKeyGateway<S, F> {
    credentials: S,
    cipher: KeyCipher,
    factory: F,
}

impl<S, F> TenantKeyGateway<S, F> {
    pub fn new(credentials: S, cipher: KeyCipher, factory: F) -> Self {
        Self {
            credentials,
            cipher,
            factory,
        }
    }
}

impl<S, F> ProviderGateway for TenantKeyGateway<S, F>
where
    S: TenantCredentialsSource,
    F: ProviderFactory,
{
    fn get_provider(&self, tenant_id: TenantId) -> Result<Box<dyn AiProvider>, AiError> {
        let creds = self
            .credentials
            .credentials(tenant_id)?
            .ok_or_else(|| AiError::unavailable("tenant has no AI settings"))?;

        let encrypted = creds
            .encrypted_api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AiError::unavailable("tenant has no API key configured"))?;

        let plaintext = self.cipher.decrypt(&encrypted)?;
        if plaintext.trim().is_empty() {
            return Err(AiError::unavailable("tenant API key is empty"));
        }

        debug!(tenant = %tenant_id, model = ?creds.model, "binding AI provider");

        self.factory.build(ProviderBinding {
            tenant_id,
            api_key: ApiKey::new(plaintext),
            model: creds.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::provider::{
        LessonContentRequest, LessonContentResponse, OutlineRequest, OutlineResponse,
        ProcessContentRequest, ProcessContentResponse,
    };

    struct MapSource(HashMap<TenantId, TenantCredentials>);

    impl TenantCredentialsSource for MapSource {
        fn credentials(&self, tenant_id: TenantId) -> Result<Option<TenantCredentials>, AiError> {
            Ok(self.0.get(&tenant_id).cloned())
        }
    }

    struct NullProvider;

    impl AiProvider for NullProvider {
        fn generate_outline(&self, _: &OutlineRequest) -> Result<OutlineResponse, AiError> {
            Ok(OutlineResponse {
                sections: vec![],
                tokens_used: 0,
            })
        }

        fn generate_lesson_content(
            &self,
            _: &LessonContentRequest,
        ) -> Result<LessonContentResponse, AiError> {
            Ok(LessonContentResponse {
                components: vec![],
                segue_text: None,
                tokens_used: 0,
            })
        }

        fn process_content(
            &self,
            _: &ProcessContentRequest,
        ) -> Result<ProcessContentResponse, AiError> {
            Ok(ProcessContentResponse {
                summary: String::new(),
                chunks: vec![],
                tokens_used: 0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        bindings: Mutex<Vec<(TenantId, String)>>,
    }

    impl ProviderFactory for Arc<RecordingFactory> {
        fn build(&self, binding: ProviderBinding) -> Result<Box<dyn AiProvider>, AiError> {
            self.bindings
                .lock()
                .unwrap()
                .push((binding.tenant_id, binding.api_key.expose().to_string()));
            Ok(Box::new(NullProvider))
        }
    }

    #[test]
    fn binds_decrypted_key_per_tenant() {
        let cipher = KeyCipher::new([3u8; 32]);
        let (t1, t2) = (TenantId::new(), TenantId::new());
        let mut map = HashMap::new();
        map.insert(
            t1,
            TenantCredentials {
                encrypted_api_key: Some(cipher.encrypt("key-one").unwrap()),
                model: None,
            },
        );
        map.insert(
            t2,
            TenantCredentials {
                encrypted_api_key: Some(cipher.encrypt("key-two").unwrap()),
                model: Some("small".to_string()),
            },
        );

        let factory = Arc::new(RecordingFactory::default());
        let gateway = TenantKeyGateway::new(MapSource(map), cipher, factory.clone());

        assert!(gateway.get_provider(t1).is_ok());
        assert!(gateway.get_provider(t2).is_ok());

        let bindings = factory.bindings.lock().unwrap().clone();
        assert_eq!(
            bindings,
            vec![(t1, "key-one".to_string()), (t2, "key-two".to_string())]
        );
    }

    #[test]
    fn missing_settings_or_key_is_unavailable() {
        let cipher = KeyCipher::new([3u8; 32]);
        let tenant_without_key = TenantId::new();
        let mut map = HashMap::new();
        map.insert(
            tenant_without_key,
            TenantCredentials {
                encrypted_api_key: None,
                model: None,
            },
        );
        let gateway = TenantKeyGateway::new(
            MapSource(map),
            cipher,
            Arc::new(RecordingFactory::default()),
        );

        assert!(matches!(
            gateway.get_provider(TenantId::new()),
            Err(AiError::ProviderUnavailable(_))
        ));
        assert!(matches!(
            gateway.get_provider(tenant_without_key),
            Err(AiError::ProviderUnavailable(_))
        ));
    }

    #[test]
    fn api_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", ApiKey::new("sk-secret")), "ApiKey(***)");
    }
}
