use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use bistro_core::identity::{Caller, Role};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

/// Mint a token for `subject`. The identity provider normally does this; the
/// API uses it for tooling and tests.
pub fn issue_token(
    secret: &str,
    subject: &str,
    role: Role,
    ttl_seconds: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = chrono::Utc::now().timestamp() + i64::try_from(ttl_seconds).unwrap_or(i64::MAX / 2);
    let claims = Claims {
        sub: subject.to_string(),
        role: format!("{:?}", role).to_ascii_lowercase(),
        exp: usize::try_from(exp).unwrap_or(0),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn caller_from_token(secret: &str, token: &str) -> Result<Caller, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::AuthenticationError(format!("Invalid token: {}", e)))?;

    let role = token_data
        .claims
        .role
        .parse::<Role>()
        .map_err(|e| AppError::AuthenticationError(e.to_string()))?;
    Ok(Caller::new(token_data.claims.sub, role))
}

// ============================================================================
// Authentication Middleware
// ============================================================================

/// Resolve the caller for every request. No token means a guest; a bad token
/// is rejected outright rather than downgraded.
pub async fn authenticate(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Response {
    let caller = match bearer {
        Some(TypedHeader(Authorization(bearer))) => {
            match caller_from_token(&state.auth.secret, bearer.token()) {
                Ok(caller) => caller,
                Err(err) => return err.into_response(),
            }
        }
        None => Caller::guest(),
    };

    req.extensions_mut().insert(caller);
    next.run(req).await
}

// ============================================================================
// Capabilities
// ============================================================================

/// A rule over callers, checked by the `Authorized` extractor before a
/// handler runs.
pub trait Capability: Send + Sync + 'static {
    fn allows(caller: &Caller) -> bool;
}

pub struct Anyone;
pub struct SignedIn;
pub struct CourierOrAdmin;

impl Capability for Anyone {
    fn allows(_caller: &Caller) -> bool {
        true
    }
}

impl Capability for SignedIn {
    fn allows(caller: &Caller) -> bool {
        !caller.is_guest()
    }
}

impl Capability for CourierOrAdmin {
    fn allows(caller: &Caller) -> bool {
        matches!(caller.role, Role::Courier | Role::Admin) && caller.subject().is_some()
    }
}

/// The authenticated caller, proven to hold capability `C`.
pub struct Authorized<C> {
    pub caller: Caller,
    _capability: PhantomData<C>,
}

impl<S, C> FromRequestParts<S> for Authorized<C>
where
    S: Send + Sync,
    C: Capability,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = parts
            .extensions
            .get::<Caller>()
            .cloned()
            .unwrap_or_else(Caller::guest);

        if !C::allows(&caller) {
            return Err(if caller.is_guest() {
                AppError::AuthenticationError("Authentication required".to_string())
            } else {
                AppError::AuthorizationError("Insufficient role for this operation".to_string())
            });
        }

        Ok(Self {
            caller,
            _capability: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_round_trips() {
        let token = issue_token("secret", "courier-7", Role::Courier, 60).unwrap();
        let caller = caller_from_token("secret", &token).unwrap();
        assert_eq!(caller, Caller::courier("courier-7"));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = issue_token("secret", "admin-1", Role::Admin, 60).unwrap();
        assert!(matches!(
            caller_from_token("other", &token),
            Err(AppError::AuthenticationError(_))
        ));
    }

    #[test]
    fn test_capabilities() {
        let guest = Caller::guest();
        let customer = Caller::customer("c-1");
        let courier = Caller::courier("k-1");
        let admin = Caller::admin("a-1");

        assert!(Anyone::allows(&guest));
        assert!(!SignedIn::allows(&guest));
        assert!(SignedIn::allows(&customer));
        assert!(!CourierOrAdmin::allows(&customer));
        assert!(CourierOrAdmin::allows(&courier));
        assert!(CourierOrAdmin::allows(&admin));
        assert!(!SignedIn::allows(&Caller::guest()));
    }
}
