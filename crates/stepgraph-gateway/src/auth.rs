use stepgraph_core::config::{ApiKeyRole, GatewayConfig};

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

/// Bearer header -> api_keys -> anonymous.
///
/// Returns `None` on auth failure. With no keys configured every caller is
/// an anonymous admin, but a bearer that matches nothing is still rejected.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>) -> Option<AuthResult> {
    if let Some(bearer_val) = bearer {
        return config
            .api_keys
            .iter()
            .find(|ak| ak.key == bearer_val)
            .map(|ak| AuthResult {
                name: ak.name.clone(),
                role: ak.role.clone(),
            });
    }

    if config.api_keys.is_empty() {
        Some(AuthResult {
            name: "anonymous".into(),
            role: ApiKeyRole::Admin,
        })
    } else {
        None
    }
}

/// Check if a role has at least viewer-level access.
pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Check if a role has at least operator-level access.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_core::config::ApiKeyConfig;

    fn gateway(api_keys: Vec<ApiKeyConfig>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:8000".to_string(),
            api_keys,
        }
    }

    #[test]
    fn test_no_keys_is_anonymous_admin() {
        let config = gateway(vec![]);
        let auth = validate_auth(&config, None).unwrap();
        assert_eq!(auth.name, "anonymous");
        assert_eq!(auth.role, ApiKeyRole::Admin);
        // Bearer with no match
        assert!(validate_auth(&config, Some("anything")).is_none());
    }

    #[test]
    fn test_api_key_roles() {
        let keys = vec![
            ApiKeyConfig {
                name: "dashboard".to_string(),
                key: "sk_view".to_string(),
                role: ApiKeyRole::Viewer,
            },
            ApiKeyConfig {
                name: "ci".to_string(),
                key: "sk_ops".to_string(),
                role: ApiKeyRole::Operator,
            },
        ];
        let config = gateway(keys);

        let viewer = validate_auth(&config, Some("sk_view")).unwrap();
        assert_eq!(viewer.name, "dashboard");
        assert!(has_viewer_access(&viewer.role));
        assert!(!has_operator_access(&viewer.role));

        let operator = validate_auth(&config, Some("sk_ops")).unwrap();
        assert!(has_operator_access(&operator.role));

        assert!(validate_auth(&config, Some("wrong")).is_none());
        // Keys configured, no bearer
        assert!(validate_auth(&config, None).is_none());
    }
}
