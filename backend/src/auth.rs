use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
// password hashing (argon2)
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extract::ApiJson;
use crate::routes::AppState;

pub async fn register(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<RegisterReq>,
) -> AppResult<(StatusCode, Json<AuthResp>)> {
    let new_user = validate_registration(payload)?;

    let username_taken: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM users WHERE username = $1")
            .bind(&new_user.username)
            .fetch_optional(&state.pool)
            .await?;
    if username_taken.is_some() {
        return Err(AppError::validation("Username already exists"));
    }
    let email_taken: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(&new_user.email)
        .fetch_optional(&state.pool)
        .await?;
    if email_taken.is_some() {
        return Err(AppError::validation("Email already exists"));
    }

    let password_hash = hash_password(&new_user.password)
        .map_err(|e| AppError::Internal(format!("hash error: {e}")))?;

    let row: UserRow = sqlx::query_as(
        r#"
        INSERT INTO users (id, username, email, password_hash, first_name, last_name)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, username, email, password_hash, first_name, last_name,
                  enabled, role, created_at, last_login_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&new_user.username)
    .bind(&new_user.email)
    .bind(password_hash)
    .bind(&new_user.first_name)
    .bind(&new_user.last_name)
    .fetch_one(&state.pool)
    .await?;

    let token = encode_jwt(&state.config, &row)?;
    tracing::info!(user_id = %row.id, username = %row.username, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResp {
            success: true,
            message: "Registration successful".to_string(),
            token,
            user: row.into(),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LoginReq>,
) -> AppResult<Json<AuthResp>> {
    let (Some(ident), Some(password)) = (
        non_blank(payload.username_or_email),
        non_blank(payload.password),
    ) else {
        return Err(AppError::validation(
            "Username/email and password are required",
        ));
    };

    let row: Option<UserRow> = sqlx::query_as(
        r#"
        SELECT id, username, email, password_hash, first_name, last_name,
               enabled, role, created_at, last_login_at
        FROM users
        WHERE username = $1 OR email = $2
        "#,
    )
    .bind(&ident)
    .bind(ident.to_lowercase())
    .fetch_optional(&state.pool)
    .await?;

    let Some(row) = row else {
        return Err(AppError::unauthorized("Invalid username/email or password"));
    };
    let is_valid = verify_password(&password, &row.password_hash)
        .map_err(|e| AppError::Internal(format!("verify error: {e}")))?;
    if !is_valid {
        return Err(AppError::unauthorized("Invalid username/email or password"));
    }
    if !row.enabled {
        return Err(AppError::unauthorized("Account is disabled"));
    }

    let row: UserRow = sqlx::query_as(
        r#"
        UPDATE users SET last_login_at = now()
        WHERE id = $1
        RETURNING id, username, email, password_hash, first_name, last_name,
                  enabled, role, created_at, last_login_at
        "#,
    )
    .bind(row.id)
    .fetch_one(&state.pool)
    .await?;

    let token = encode_jwt(&state.config, &row)?;
    tracing::info!(user_id = %row.id, "user logged in");

    Ok(Json(AuthResp {
        success: true,
        message: "Login successful".to_string(),
        token,
        user: row.into(),
    }))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<MeResp>> {
    let row: Option<UserRow> = sqlx::query_as(
        r#"
        SELECT id, username, email, password_hash, first_name, last_name,
               enabled, role, created_at, last_login_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(user.user_id)
    .fetch_optional(&state.pool)
    .await?;

    let row = row.ok_or_else(|| AppError::not_found("User not found"))?;
    if !row.enabled {
        return Err(AppError::unauthorized("User not found or disabled"));
    }
    Ok(Json(MeResp {
        success: true,
        user: row.into(),
    }))
}

/// Tokens are stateless; the client just drops its copy.
pub async fn signout(Extension(user): Extension<AuthUser>) -> Json<serde_json::Value> {
    tracing::info!(user_id = %user.user_id, "user signed out");
    Json(serde_json::json!({ "success": true, "message": "Signed out successfully" }))
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(
    password: &str,
    stored_hash: &str,
) -> Result<bool, argon2::password_hash::Error> {
    let parsed = PasswordHash::new(stored_hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

pub fn encode_jwt(config: &Config, user: &UserRow) -> AppResult<String> {
    let now = Utc::now();
    let expire = Duration::hours(config.jwt_expiration_hours);
    let claims = Claims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        role: user.role.clone(),
        iat: now.timestamp() as usize,
        exp: (now + expire).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("jwt encode error: {e}")))
}

pub fn decode_jwt(secret: &str, token: &str) -> AppResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AppError::unauthorized(format!("Invalid or expired token: {e}")))?;

    Ok(data.claims)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?;

    let token = auth
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized("Invalid Authorization scheme"))?;

    let claims = decode_jwt(&state.config.jwt_secret, token)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::unauthorized("Invalid sub in token"))?;

    req.extensions_mut().insert(AuthUser {
        user_id,
        username: claims.username,
        role: claims.role,
    });

    Ok(next.run(req).await)
}

struct NewUser {
    username: String,
    email: String,
    password: String,
    first_name: Option<String>,
    last_name: Option<String>,
}

fn validate_registration(req: RegisterReq) -> AppResult<NewUser> {
    let (Some(username), Some(email), Some(password)) = (
        non_blank(req.username),
        non_blank(req.email),
        req.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::validation(
            "Username, email, and password are required",
        ));
    };

    let len = username.chars().count();
    if !(3..=50).contains(&len) {
        return Err(AppError::validation(
            "Username must be between 3 and 50 characters",
        ));
    }
    if password.chars().count() < 6 {
        return Err(AppError::validation(
            "Password must be at least 6 characters",
        ));
    }
    let email = email.to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::validation("Email is not valid"));
    }

    let first_name = non_blank(req.first_name);
    let last_name = non_blank(req.last_name);
    for name in [&first_name, &last_name].into_iter().flatten() {
        if name.chars().count() > 100 {
            return Err(AppError::validation("Names must be at most 100 characters"));
        }
    }

    Ok(NewUser {
        username,
        email,
        password,
        first_name,
        last_name,
    })
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id (uuid string)
    pub username: String,
    pub role: String,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterReq {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginReq {
    pub username_or_email: Option<String>,
    pub password: Option<String>,
}

#[derive(Serialize)]
pub struct AuthResp {
    pub success: bool,
    pub message: String,
    pub token: String,
    pub user: UserDto,
}

#[derive(Serialize)]
pub struct MeResp {
    pub success: bool,
    pub user: UserDto,
}

#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
}

#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for UserDto {
    fn from(r: UserRow) -> Self {
        let full_name = match (&r.first_name, &r.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => r.username.clone(),
        };
        Self {
            id: r.id,
            username: r.username,
            email: r.email,
            first_name: r.first_name,
            last_name: r.last_name,
            full_name,
            role: r.role,
            created_at: r.created_at,
            last_login_at: r.last_login_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            jwt_secret: "0123456789abcdef0123456789abcdef".into(),
            jwt_expiration_hours: 1,
            bind_addr: "127.0.0.1:0".into(),
            db_max_connections: 1,
        }
    }

    fn user_row() -> UserRow {
        UserRow {
            id: Uuid::new_v4(),
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            first_name: Some("Alice".into()),
            last_name: None,
            enabled: true,
            role: "USER".into(),
            created_at: Utc::now(),
            last_login_at: None,
        }
    }

    fn register_req(username: &str, email: &str, password: &str) -> RegisterReq {
        RegisterReq {
            username: Some(username.into()),
            email: Some(email.into()),
            password: Some(password.into()),
            first_name: None,
            last_name: None,
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &hash).unwrap());
        assert!(!verify_password("hunter23", &hash).unwrap());
    }

    #[test]
    fn jwt_carries_user_identity() {
        let cfg = config();
        let user = user_row();
        let token = encode_jwt(&cfg, &user).unwrap();
        let claims = decode_jwt(&cfg.jwt_secret, &token).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "USER");
    }

    #[test]
    fn jwt_with_wrong_secret_is_unauthorized() {
        let cfg = config();
        let token = encode_jwt(&cfg, &user_row()).unwrap();
        let err = decode_jwt("another-secret-another-secret-xx", &token).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn registration_rules() {
        assert!(validate_registration(register_req("bob", "Bob@Example.com", "secret")).is_ok());
        assert_eq!(
            validate_registration(register_req("bob", "bob@example.com", "secret"))
                .unwrap()
                .email,
            "bob@example.com"
        );
        assert!(validate_registration(register_req("bo", "bob@example.com", "secret")).is_err());
        assert!(validate_registration(register_req("bob", "bob@example.com", "12345")).is_err());
        assert!(validate_registration(register_req("bob", "not-an-email", "secret")).is_err());
        assert!(validate_registration(register_req("  ", "bob@example.com", "secret")).is_err());
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a b@c.de"));
        assert!(!is_valid_email("a@@b.co"));
    }

    #[test]
    fn full_name_falls_back_to_username() {
        let mut row = user_row();
        assert_eq!(UserDto::from(user_row()).full_name, "Alice");
        row.first_name = None;
        assert_eq!(UserDto::from(row).full_name, "alice");
    }
}
