use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

// `sub` stays a raw JSON value: upstream issuers encode the user id as a
// number or a numeric string depending on their JWT library.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserTokenClaims {
    sub: Value,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct JwtTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_user_token(&self, user_id: i64) -> anyhow::Result<String> {
        self.issue_user_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_user_token_at(&self, user_id: i64, issued_at: i64) -> anyhow::Result<String> {
        let claims = UserTokenClaims {
            sub: Value::from(user_id),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Verify a token against the shared secret and extract its numeric
    /// subject.
    pub fn verify_user_token(&self, token: &str) -> anyhow::Result<i64> {
        let claims = decode::<UserTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        numeric_subject(&claims.sub)
            .ok_or_else(|| anyhow!("access token subject '{}' is not numeric", claims.sub))
    }
}

fn numeric_subject(sub: &Value) -> Option<i64> {
    match sub {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
