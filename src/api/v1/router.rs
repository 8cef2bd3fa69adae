use super::error::*;
use super::handler;
use crate::application_port::*;
use crate::domain_model::AuthenticatedPrincipal;
use crate::server::*;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, http, reject};

const MAX_BODY_BYTES: u64 = 16 * 1024;

pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    session_routes(server.session_service.clone())
}

/// Everything under `/session`.
pub fn session_routes(
    session_service: Arc<dyn SessionService>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let login = warp::post()
        .and(warp::path("login"))
        .and(warp::path::end())
        .and(json_body())
        .and(with(session_service.clone()))
        .and_then(handler::login);

    let refresh = warp::post()
        .and(warp::path("refresh"))
        .and(warp::path::end())
        .and(json_body())
        .and(with(session_service.clone()))
        .and_then(handler::refresh);

    let logout = warp::post()
        .and(warp::path("logout"))
        .and(warp::path::end())
        .and(json_body())
        .and(with(session_service.clone()))
        .and_then(handler::logout);

    let logout_all = warp::post()
        .and(warp::path("logout_all"))
        .and(warp::path::end())
        .and(with_verification(session_service.clone()))
        .and(with(session_service.clone()))
        .and_then(handler::logout_all);

    let me = warp::get()
        .and(warp::path("me"))
        .and(warp::path::end())
        .and(with_verification(session_service.clone()))
        .and_then(handler::me);

    let active = warp::get()
        .and(warp::path("active"))
        .and(warp::path::end())
        .and(with_verification(session_service.clone()))
        .and(with(session_service))
        .and_then(handler::active_sessions);

    warp::path("session").and(
        login
            .or(refresh)
            .or(logout)
            .or(logout_all)
            .or(me)
            .or(active),
    )
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone
where
    T: DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn with<ServiceType>(
    service: Arc<ServiceType>,
) -> impl Filter<Extract = (Arc<ServiceType>,), Error = Infallible> + Clone
where
    ServiceType: Send + Sync + ?Sized,
{
    warp::any().map(move || service.clone())
}

fn with_verification(
    session_service: Arc<dyn SessionService>,
) -> impl Filter<Extract = (AuthenticatedPrincipal,), Error = warp::Rejection> + Clone {
    warp::header::<String>(http::header::AUTHORIZATION.as_ref()).and_then(move |token: String| {
        let session_service = session_service.clone();
        async move {
            if let Some(token) = token.strip_prefix("Bearer ") {
                let principal = session_service
                    .validate(token)
                    .await
                    .map_err(ApiErrorCode::from)
                    .map_err(reject::custom)?;
                Ok(principal)
            } else {
                Err(reject::custom(ApiErrorCode::Unauthenticated))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::*;
    use crate::domain_model::*;
    use crate::domain_port::*;
    use crate::infra_memory::*;
    use chrono::Utc;
    use serde_json::{Value, json};
    use std::time::Duration;
    use warp::http::StatusCode;

    struct PlainHasher;

    #[async_trait::async_trait]
    impl CredentialHasher for PlainHasher {
        async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
            Ok(password.to_string())
        }

        async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
            Ok(password == hash)
        }
    }

    fn service() -> Arc<dyn SessionService> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let principals = Arc::new(InMemoryPrincipalRepo::new());
        principals.insert(PrincipalRecord {
            principal: Principal {
                id: PrincipalId::new_random(),
                username: "dana".into(),
                role: Role::Editor,
                is_active: true,
            },
            password_hash: "pw".into(),
        });
        let codec = Arc::new(JwtHs256Codec::new(
            JwtConfig {
                issuer: "scriptorium.auth".into(),
                audience: "scriptorium-web".into(),
                signing_key: b"router-test-key".to_vec(),
            },
            clock.clone(),
        ));
        Arc::new(RealSessionService::new(
            principals,
            Arc::new(PlainHasher),
            codec,
            Arc::new(InMemoryRefreshSessionStore::new()),
            clock,
            SessionTtl {
                access: Duration::from_secs(900),
                refresh: Duration::from_secs(86_400),
            },
        ))
    }

    fn body<B: AsRef<[u8]>>(res: &warp::http::Response<B>) -> Value {
        serde_json::from_slice(res.body().as_ref()).unwrap()
    }

    async fn login<F>(api: &F) -> Value
    where
        F: Filter + 'static,
        F::Extract: warp::Reply + Send,
    {
        let res = warp::test::request()
            .method("POST")
            .path("/session/login")
            .json(&json!({ "username": "dana", "password": "pw" }))
            .reply(api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        body(&res)["data"]["tokens"].clone()
    }

    #[tokio::test]
    async fn login_me_refresh_logout_flow() {
        let api = session_routes(service()).recover(recover_error);
        let tokens = login(&api).await;
        let access = tokens["access_token"].as_str().unwrap().to_string();
        let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

        let res = warp::test::request()
            .method("GET")
            .path("/session/me")
            .header("authorization", format!("Bearer {access}"))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res)["data"]["role"], "editor");

        let res = warp::test::request()
            .method("POST")
            .path("/session/refresh")
            .json(&json!({ "refresh_token": refresh }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let rotated = body(&res)["data"]["refresh_token"].as_str().unwrap().to_string();
        assert_ne!(rotated, refresh);

        // Reusing the consumed token.
        let res = warp::test::request()
            .method("POST")
            .path("/session/refresh")
            .json(&json!({ "refresh_token": refresh }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res)["error"]["code"], "InvalidToken");

        for _ in 0..2 {
            let res = warp::test::request()
                .method("POST")
                .path("/session/logout")
                .json(&json!({ "refresh_token": rotated }))
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(body(&res)["success"], true);
        }
    }

    #[tokio::test]
    async fn bad_credentials_and_missing_bearer_are_401() {
        let api = session_routes(service()).recover(recover_error);

        let res = warp::test::request()
            .method("POST")
            .path("/session/login")
            .json(&json!({ "username": "dana", "password": "nope" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res)["error"]["code"], "Unauthenticated");

        let res = warp::test::request()
            .method("GET")
            .path("/session/me")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = warp::test::request()
            .method("GET")
            .path("/session/me")
            .header("authorization", "Bearer not-a-jwt")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res)["error"]["code"], "InvalidToken");
    }

    #[tokio::test]
    async fn logout_all_empties_the_active_list() {
        let api = session_routes(service()).recover(recover_error);
        login(&api).await;
        let tokens = login(&api).await;
        let bearer = format!("Bearer {}", tokens["access_token"].as_str().unwrap());

        let res = warp::test::request()
            .method("GET")
            .path("/session/active")
            .header("authorization", &bearer)
            .reply(&api)
            .await;
        assert_eq!(body(&res)["data"]["count"], 2);

        let res = warp::test::request()
            .method("POST")
            .path("/session/logout_all")
            .header("authorization", &bearer)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .method("GET")
            .path("/session/active")
            .header("authorization", &bearer)
            .reply(&api)
            .await;
        assert_eq!(body(&res)["data"]["count"], 0);
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let api = session_routes(service()).recover(recover_error);
        let res = warp::test::request()
            .method("POST")
            .path("/session/refresh")
            .header("content-type", "application/json")
            .body("{\"token\":")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
