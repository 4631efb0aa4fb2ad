//! Managed-authentication token sources for cloud-hosted PostgreSQL.
//!
//! - [`AwsRdsTokenSource`]: RDS IAM tokens, a SigV4-presigned `connect`
//!   request signed locally with credentials from the environment. Valid
//!   for 15 minutes.
//! - [`AzureTokenSource`]: Microsoft Entra tokens for a managed identity,
//!   fetched from the instance metadata service.

use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use poolkeeper_core::{
    AuthConfig, ConnectionArgs, PoolError, PoolResult, Token, TokenProvider, TokenSource,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Lifetime of an RDS IAM token.
pub const AWS_TOKEN_TTL: Duration = Duration::from_secs(900);

/// Instance metadata endpoint for managed-identity tokens.
pub const AZURE_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Token scope for Azure Database for PostgreSQL.
pub const AZURE_DEFAULT_SCOPE: &str = "https://ossrdbms-aad.database.windows.net/.default";

const AWS_SERVICE: &str = "rds-db";
const AWS_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const AZURE_IMDS_API_VERSION: &str = "2018-02-01";
const AZURE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PORT: u16 = 5432;

type HmacSha256 = Hmac<Sha256>;

/// Build the token provider described by an `[connection.auth]` table.
pub fn token_provider(auth: &AuthConfig, args: &ConnectionArgs) -> PoolResult<TokenProvider> {
    let source: Box<dyn TokenSource> = match auth {
        AuthConfig::Aws { region, .. } => {
            let host = args
                .host
                .as_deref()
                .filter(|host| !host.is_empty())
                .ok_or_else(|| {
                    PoolError::Config("aws authentication requires connection.host".to_string())
                })?;
            Box::new(AwsRdsTokenSource::new(
                host,
                args.port.unwrap_or(DEFAULT_PORT),
                &args.username,
                region,
            ))
        }
        AuthConfig::Azure {
            client_id,
            identity_scope,
            ..
        } => Box::new(AzureTokenSource::new(
            client_id.clone(),
            identity_scope.as_deref(),
        )),
    };
    Ok(TokenProvider::with_skew(source, auth.skew()))
}

// ── AWS ─────────────────────────────────────────────────────────────

/// Static or session credentials used to sign RDS tokens.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN`.
    pub fn from_env() -> PoolResult<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        match (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Self {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }),
            _ => Err(PoolError::Token(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set for RDS IAM authentication"
                    .to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Signs RDS IAM authentication tokens.
#[derive(Debug)]
pub struct AwsRdsTokenSource {
    host: String,
    port: u16,
    username: String,
    region: String,
    /// Read from the environment on every fetch when unset.
    credentials: Option<AwsCredentials>,
}

impl AwsRdsTokenSource {
    pub fn new(host: &str, port: u16, username: &str, region: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            region: region.to_string(),
            credentials: None,
        }
    }

    pub fn with_credentials(self, credentials: AwsCredentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..self
        }
    }

    /// The presigned `connect` request, without scheme, as RDS expects it
    /// in the password field.
    pub fn presign(&self, credentials: &AwsCredentials, now: DateTime<Utc>) -> PoolResult<String> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/{AWS_SERVICE}/aws4_request", self.region);
        let endpoint = format!("{}:{}", self.host, self.port);

        let mut query = vec![
            ("Action", "connect".to_string()),
            ("DBUser", self.username.clone()),
            ("X-Amz-Algorithm", AWS_ALGORITHM.to_string()),
            (
                "X-Amz-Credential",
                format!("{}/{scope}", credentials.access_key_id),
            ),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", AWS_TOKEN_TTL.as_secs().to_string()),
            ("X-Amz-SignedHeaders", "host".to_string()),
        ];
        if let Some(session_token) = &credentials.session_token {
            query.push(("X-Amz-Security-Token", session_token.clone()));
        }
        query.sort_by(|a, b| a.0.cmp(b.0));
        let canonical_query = query
            .iter()
            .map(|(key, value)| format!("{}={}", uri_encode(key), uri_encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n/\n{canonical_query}\nhost:{endpoint}\n\nhost\n{}",
            hex::encode(Sha256::digest(b""))
        );
        let string_to_sign = format!(
            "{AWS_ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(&credentials.secret_access_key, &date, &self.region, AWS_SERVICE)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "{endpoint}/?{canonical_query}&X-Amz-Signature={signature}"
        ))
    }
}

#[async_trait]
impl TokenSource for AwsRdsTokenSource {
    async fn fetch_token(&self) -> PoolResult<Token> {
        let credentials = match &self.credentials {
            Some(credentials) => credentials.clone(),
            None => AwsCredentials::from_env()?,
        };
        let token = self.presign(&credentials, Utc::now())?;
        tracing::debug!(host = %self.host, region = %self.region, "signed RDS IAM token");
        Ok(Token::with_ttl(token, AWS_TOKEN_TTL))
    }
}

/// RFC 3986 percent-encoding as SigV4 requires: only unreserved characters
/// pass through.
fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> PoolResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PoolError::Token(format!("invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> PoolResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

// ── Azure ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ImdsToken {
    access_token: String,
    expires_on: EpochSeconds,
}

/// IMDS reports `expires_on` as a string; other identity endpoints use a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum EpochSeconds {
    Number(u64),
    Text(String),
}

impl EpochSeconds {
    fn seconds(&self) -> PoolResult<u64> {
        match self {
            EpochSeconds::Number(secs) => Ok(*secs),
            EpochSeconds::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| PoolError::Token(format!("invalid expires_on: {text}"))),
        }
    }
}

/// Fetches managed-identity tokens from the instance metadata service.
#[derive(Debug)]
pub struct AzureTokenSource {
    client: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
    resource: String,
}

impl AzureTokenSource {
    /// `identity_scope` defaults to [`AZURE_DEFAULT_SCOPE`]. IMDS takes a
    /// resource URI, so a trailing `/.default` is dropped.
    pub fn new(client_id: Option<String>, identity_scope: Option<&str>) -> Self {
        let scope = identity_scope.unwrap_or(AZURE_DEFAULT_SCOPE);
        Self {
            // The metadata endpoint is link-local and must not be proxied.
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_default(),
            endpoint: AZURE_IMDS_ENDPOINT.to_string(),
            client_id,
            resource: scope.trim_end_matches("/.default").to_string(),
        }
    }

    pub fn with_endpoint(self, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..self
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

#[async_trait]
impl TokenSource for AzureTokenSource {
    async fn fetch_token(&self) -> PoolResult<Token> {
        let mut query = vec![
            ("api-version", AZURE_IMDS_API_VERSION),
            ("resource", self.resource.as_str()),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .header("Metadata", "true")
            .timeout(AZURE_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| PoolError::Token(format!("requesting managed identity token: {e}")))?
            .error_for_status()
            .map_err(|e| PoolError::Token(format!("managed identity endpoint: {e}")))?;
        let body: ImdsToken = response
            .json()
            .await
            .map_err(|e| PoolError::Token(format!("parsing managed identity token: {e}")))?;

        let expires_at = UNIX_EPOCH + Duration::from_secs(body.expires_on.seconds()?);
        tracing::debug!(resource = %self.resource, "fetched managed identity token");
        Ok(Token {
            value: body.access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        // 2024-01-02T03:04:05Z
        DateTime::from_timestamp(1_704_164_645, 0).unwrap()
    }

    #[test]
    fn signing_key_matches_published_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encode_keeps_only_unreserved() {
        assert_eq!(uri_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(uri_encode("AKID/20240102 x+y"), "AKID%2F20240102%20x%2By");
    }

    #[test]
    fn presigned_token_layout() {
        let source = AwsRdsTokenSource::new("orders.rds.amazonaws.com", 5432, "iam_monitor", "eu-west-1");
        let token = source.presign(&credentials(), fixed_time()).unwrap();

        let (unsigned, signature) = token.split_once("&X-Amz-Signature=").unwrap();
        assert_eq!(
            unsigned,
            "orders.rds.amazonaws.com:5432/?Action=connect&DBUser=iam_monitor\
             &X-Amz-Algorithm=AWS4-HMAC-SHA256\
             &X-Amz-Credential=AKIDEXAMPLE%2F20240102%2Feu-west-1%2Frds-db%2Faws4_request\
             &X-Amz-Date=20240102T030405Z&X-Amz-Expires=900&X-Amz-SignedHeaders=host"
        );
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(!token.contains("wJalrXUtnFEMI"));
    }

    #[test]
    fn presigning_is_deterministic_and_scoped() {
        let source = AwsRdsTokenSource::new("orders.rds.amazonaws.com", 5432, "iam_monitor", "eu-west-1");
        let a = source.presign(&credentials(), fixed_time()).unwrap();
        let b = source.presign(&credentials(), fixed_time()).unwrap();
        assert_eq!(a, b);

        let other_user = AwsRdsTokenSource::new("orders.rds.amazonaws.com", 5432, "reporting", "eu-west-1");
        let c = other_user.presign(&credentials(), fixed_time()).unwrap();
        assert_ne!(
            a.split_once("X-Amz-Signature=").unwrap().1,
            c.split_once("X-Amz-Signature=").unwrap().1
        );
    }

    #[test]
    fn session_token_is_signed_in() {
        let source = AwsRdsTokenSource::new("db.internal", 6432, "iam_monitor", "us-east-1");
        let creds = AwsCredentials {
            session_token: Some("FwoG/session+token=".to_string()),
            ..credentials()
        };
        let token = source.presign(&creds, fixed_time()).unwrap();
        assert!(token.starts_with("db.internal:6432/?"));
        assert!(token.contains(
            "&X-Amz-Security-Token=FwoG%2Fsession%2Btoken%3D&X-Amz-SignedHeaders=host&"
        ));
    }

    #[tokio::test]
    async fn aws_token_lives_fifteen_minutes() {
        let source = AwsRdsTokenSource::new("db.internal", 5432, "iam_monitor", "us-east-1")
            .with_credentials(credentials());
        let token = source.fetch_token().await.unwrap();

        let ttl = token
            .expires_at
            .duration_since(std::time::SystemTime::now())
            .unwrap();
        assert!(ttl > Duration::from_secs(890) && ttl <= AWS_TOKEN_TTL);
        assert!(token.value.contains("DBUser=iam_monitor"));
    }

    #[test]
    fn azure_scope_maps_to_resource() {
        assert_eq!(
            AzureTokenSource::new(None, None).resource(),
            "https://ossrdbms-aad.database.windows.net"
        );
        assert_eq!(
            AzureTokenSource::new(None, Some("api://custom/.default")).resource(),
            "api://custom"
        );
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/metadata/identity/oauth2/token"), handle)
    }

    #[tokio::test]
    async fn azure_token_from_metadata_service() {
        let (endpoint, server) = serve_once(
            "200 OK",
            r#"{"access_token":"eyJ0eXAiOiJKV1Qi","expires_on":"1900000000","token_type":"Bearer"}"#,
        )
        .await;
        let source = AzureTokenSource::new(Some("3f1c2d4e".to_string()), None).with_endpoint(&endpoint);

        let token = source.fetch_token().await.unwrap();
        assert_eq!(token.value, "eyJ0eXAiOiJKV1Qi");
        assert_eq!(token.expires_at, UNIX_EPOCH + Duration::from_secs(1_900_000_000));

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /metadata/identity/oauth2/token?"));
        assert!(request.contains("api-version=2018-02-01"));
        assert!(request.contains("resource=https%3a%2f%2fossrdbms-aad.database.windows.net"));
        assert!(request.contains("client_id=3f1c2d4e"));
        assert!(request.contains("metadata: true"));
    }

    #[tokio::test]
    async fn azure_error_status_is_token_error() {
        let (endpoint, server) = serve_once(
            "400 Bad Request",
            r#"{"error":"invalid_request","error_description":"Identity not found"}"#,
        )
        .await;
        let source = AzureTokenSource::new(None, None).with_endpoint(&endpoint);

        let err = source.fetch_token().await.unwrap_err();
        assert!(matches!(err, PoolError::Token(_)));
        server.await.unwrap();
    }

    #[test]
    fn aws_provider_requires_host() {
        let auth = AuthConfig::Aws {
            region: "us-east-1".to_string(),
            skew_secs: 60,
        };
        let args = ConnectionArgs::new("test", "iam_monitor");
        assert!(matches!(
            token_provider(&auth, &args),
            Err(PoolError::Config(_))
        ));

        let args = args.with_address("db.internal", 5432);
        assert!(token_provider(&auth, &args).is_ok());
    }
}
