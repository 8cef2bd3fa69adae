use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::expiry_after;
use chrono::{DateTime, SubsecRound};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub signing_key: Vec<u8>,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String, // principal id
    role: String,
    exp: i64,
    iat: i64,
    iss: String,
    aud: String,
    jti: String,
}

/// HS256 access credentials. Expiry is checked against the injected clock
/// with zero leeway, not by `jsonwebtoken` itself.
pub struct JwtHs256Codec {
    cfg: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JwtHs256Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtHs256Codec")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl JwtHs256Codec {
    pub fn new(cfg: JwtConfig, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_audience(&[cfg.audience.clone()]);
        validation.set_issuer(&[cfg.issuer.clone()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        JwtHs256Codec {
            encoding_key: EncodingKey::from_secret(&cfg.signing_key),
            decoding_key: DecodingKey::from_secret(&cfg.signing_key),
            validation,
            cfg,
            clock,
        }
    }

    #[inline]
    fn gen_jti() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

impl CredentialCodec for JwtHs256Codec {
    fn issue(
        &self,
        principal_id: PrincipalId,
        role: Role,
        ttl: Duration,
    ) -> Result<AccessCredential, AuthError> {
        // JWT times are whole seconds; report exactly what the claims say.
        let issued_at = self.clock.now().trunc_subsecs(0);
        let expires_at = expiry_after(issued_at, ttl)?.trunc_subsecs(0);
        let claims = AccessClaims {
            sub: principal_id.to_string(),
            role: role.as_str().to_string(),
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
            iss: self.cfg.issuer.clone(),
            aud: self.cfg.audience.clone(),
            jti: Self::gen_jti(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        Ok(AccessCredential {
            token: AccessToken(token),
            issued_at,
            expires_at,
        })
    }

    fn verify(&self, token: &AccessToken) -> Result<AuthenticatedPrincipal, AuthError> {
        let data = decode::<AccessClaims>(token.as_str(), &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(kind = ?e.kind(), "access token rejected");
                AuthError::InvalidToken
            })?;
        let claims = data.claims;

        let expires_at =
            DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::InvalidToken)?;
        if self.clock.now() > expires_at {
            debug!("access token expired");
            return Err(AuthError::InvalidToken);
        }

        let principal_id = claims
            .sub
            .parse::<PrincipalId>()
            .map_err(|_| AuthError::InvalidToken)?;
        let role = claims
            .role
            .parse::<Role>()
            .map_err(|_| AuthError::InvalidToken)?;

        Ok(AuthenticatedPrincipal { principal_id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, Utc};

    fn config(key: &str) -> JwtConfig {
        JwtConfig {
            issuer: "scriptorium.auth".to_string(),
            audience: "scriptorium-web".to_string(),
            signing_key: key.as_bytes().to_vec(),
        }
    }

    fn codec_with_clock(key: &str) -> (JwtHs256Codec, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now().trunc_subsecs(0)));
        (JwtHs256Codec::new(config(key), clock.clone()), clock)
    }

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    #[test]
    fn verify_returns_what_was_issued() {
        let (codec, _) = codec_with_clock("secret-one");
        let principal_id = PrincipalId::new_random();

        for role in [Role::Admin, Role::Editor, Role::Author] {
            let credential = codec.issue(principal_id, role, FIVE_MINUTES).unwrap();
            assert_eq!(credential.expires_at - credential.issued_at, chrono::Duration::minutes(5));

            let verified = codec.verify(&credential.token).unwrap();
            assert_eq!(verified.principal_id, principal_id);
            assert_eq!(verified.role, role);
        }
    }

    #[test]
    fn expired_credential_is_invalid() {
        let (codec, clock) = codec_with_clock("secret-one");
        let credential = codec
            .issue(PrincipalId::new_random(), Role::Author, FIVE_MINUTES)
            .unwrap();

        clock.advance(FIVE_MINUTES);
        assert!(codec.verify(&credential.token).is_ok());

        clock.advance(Duration::from_secs(1));
        assert_eq!(codec.verify(&credential.token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn reported_expiry_matches_the_claim() {
        let start = Utc::now().trunc_subsecs(0) + chrono::Duration::milliseconds(750);
        let clock = Arc::new(ManualClock::new(start));
        let codec = JwtHs256Codec::new(config("secret-one"), clock.clone());
        let credential = codec
            .issue(PrincipalId::new_random(), Role::Editor, FIVE_MINUTES)
            .unwrap();

        assert_eq!(credential.issued_at.timestamp_subsec_nanos(), 0);
        assert_eq!(credential.expires_at.timestamp_subsec_nanos(), 0);
        assert_eq!(credential.expires_at, start.trunc_subsecs(0) + chrono::Duration::minutes(5));

        // 250ms past the reported expiry, still inside the same second as the claim.
        clock.advance(FIVE_MINUTES - Duration::from_millis(500));
        assert!(clock.now() > credential.expires_at);
        assert_eq!(codec.verify(&credential.token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn credential_signed_with_another_key_is_invalid() {
        let (issuer, _) = codec_with_clock("secret-one");
        let (verifier, _) = codec_with_clock("secret-two");
        let credential = issuer
            .issue(PrincipalId::new_random(), Role::Admin, FIVE_MINUTES)
            .unwrap();

        assert_eq!(verifier.verify(&credential.token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn spliced_payload_is_invalid() {
        let (codec, _) = codec_with_clock("secret-one");
        let author = codec
            .issue(PrincipalId::new_random(), Role::Author, FIVE_MINUTES)
            .unwrap();
        let admin = codec
            .issue(PrincipalId::new_random(), Role::Admin, FIVE_MINUTES)
            .unwrap();

        // Admin claims under the author's signature.
        let author_parts: Vec<&str> = author.token.as_str().split('.').collect();
        let admin_parts: Vec<&str> = admin.token.as_str().split('.').collect();
        let spliced = AccessToken(format!(
            "{}.{}.{}",
            author_parts[0], admin_parts[1], author_parts[2]
        ));

        assert_eq!(codec.verify(&spliced), Err(AuthError::InvalidToken));
    }

    #[test]
    fn garbage_and_foreign_audience_are_invalid() {
        let (codec, _) = codec_with_clock("secret-one");
        assert_eq!(
            codec.verify(&AccessToken("not-a-jwt".to_string())),
            Err(AuthError::InvalidToken)
        );

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut other = config("secret-one");
        other.audience = "someone-else".to_string();
        let foreign = JwtHs256Codec::new(other, clock)
            .issue(PrincipalId::new_random(), Role::Editor, FIVE_MINUTES)
            .unwrap();
        assert_eq!(codec.verify(&foreign.token), Err(AuthError::InvalidToken));
    }
}
