use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::http::header::{HeaderValue, AUTHORIZATION};
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

use crate::auth::TokenPair;
use crate::db::models::NewUser;
use crate::error::{AppError, AuthError, ValidationError};
use crate::store::bounded;
use crate::AppState;

pub const REFRESH_COOKIE: &str = "refresh_token";
const REFRESH_COOKIE_PATH: &str = "/auth";

fn require(field: &'static str, value: Option<String>, missing: &mut Vec<&'static str>) -> String {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => v,
        None => {
            missing.push(field);
            String::new()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validate(self) -> Result<Credentials, ValidationError> {
        let mut missing = Vec::new();
        let username = require("username", self.username, &mut missing);
        let password = require("password", self.password, &mut missing);

        if !missing.is_empty() {
            return Err(ValidationError { missing });
        }
        Ok(Credentials { username, password })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(self) -> Result<Registration, ValidationError> {
        let mut missing = Vec::new();
        let username = require("username", self.username, &mut missing);
        let email = require("email", self.email, &mut missing);
        let password = require("password", self.password, &mut missing);

        if !missing.is_empty() {
            return Err(ValidationError { missing });
        }
        Ok(Registration { username, email, password })
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn refresh_cookie_value(req: &HttpRequest) -> Option<String> {
    req.cookie(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

fn refresh_cookie(state: &AppState, pair: &TokenPair) -> Cookie<'static> {
    Cookie::build(REFRESH_COOKIE, pair.refresh_token.clone())
        .path(REFRESH_COOKIE_PATH)
        .http_only(true)
        .secure(state.config.auth.cookie_secure)
        .same_site(SameSite::Strict)
        .max_age(CookieDuration::seconds(state.config.auth.refresh_ttl_secs))
        .finish()
}

fn cleared_refresh_cookie() -> Cookie<'static> {
    let mut cookie = Cookie::build(REFRESH_COOKIE, "")
        .path(REFRESH_COOKIE_PATH)
        .http_only(true)
        .finish();
    cookie.make_removal();
    cookie
}

fn token_response(state: &AppState, pair: TokenPair) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((AUTHORIZATION, format!("Bearer {}", pair.access_token)))
        .cookie(refresh_cookie(state, &pair))
        .json(pair)
}

/// Blanks the bearer header and expires the refresh cookie on `response`.
fn clear_credentials(mut response: HttpResponse) -> HttpResponse {
    if let Err(e) = response.add_cookie(&cleared_refresh_cookie()) {
        error!("Failed to clear refresh cookie: {}", e);
    }
    response
        .headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_static(""));
    response
}

pub async fn register(
    req: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let registration = req.into_inner().validate()?;
    info!("Received registration request for username: {}", registration.username);

    let passwords = state.passwords.clone();
    let password = registration.password;
    let password_hash = web::block(move || passwords.hash_password(&password))
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))??;

    let user = bounded(
        Duration::from_secs(state.config.auth.store_timeout_secs),
        "create_user",
        state.users.create_user(NewUser {
            username: registration.username,
            email: registration.email,
            password_hash,
            scopes: Vec::new(),
        }),
    )
    .await
    .map_err(AuthError::from)?;

    info!("Registration successful for username: {}", user.username);
    Ok(HttpResponse::Created().json(serde_json::json!({
        "message": "Successfully registered user",
        "username": user.username,
    })))
}

pub async fn login(
    req: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let credentials = req.into_inner().validate()?;
    info!("Received login request for: {}", credentials.username);

    let pair = state
        .sessions
        .login(&credentials.username, &credentials.password)
        .await?;
    Ok(token_response(&state, pair))
}

/// Only the refresh cookie is required. A missing or unreadable bearer token
/// is still blacklisted for a full access lifetime by the session manager.
pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let Some(refresh_token) = refresh_cookie_value(&req) else {
        let missing = vec![REFRESH_COOKIE];
        return clear_credentials(AppError::from(ValidationError { missing }).error_response());
    };
    let access_token = bearer_token(&req).unwrap_or_default();

    match state.sessions.logout(&access_token, &refresh_token).await {
        Ok(()) => clear_credentials(HttpResponse::Ok().json(serde_json::json!({
            "message": "Successfully logged out"
        }))),
        Err(e) => clear_credentials(AppError::from(e).error_response()),
    }
}

/// The bearer header is optional here: an expired access token is exactly
/// what refresh exists to replace.
pub async fn refresh(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let Some(refresh_token) = refresh_cookie_value(&req) else {
        let missing = vec![REFRESH_COOKIE];
        return clear_credentials(AppError::from(ValidationError { missing }).error_response());
    };
    let access_token = bearer_token(&req).unwrap_or_default();

    match state.sessions.refresh(&access_token, &refresh_token).await {
        Ok(pair) => token_response(&state, pair),
        Err(e) => clear_credentials(AppError::from(e).error_response()),
    }
}
