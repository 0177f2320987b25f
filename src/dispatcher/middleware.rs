//! Front-side middleware: API-key authentication and CORS allow-listing.

use std::future::{ready, Ready};
use std::rc::Rc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error, HttpResponse};
use futures::future::LocalBoxFuture;

use crate::error::ProxyError;

/// Constant-time comparison against the configured API-key set, rejecting
/// with `kUnauthorized` when neither `Authorization: Bearer <key>` nor
/// `X-Api-Key: <key>` matches. An empty configured set means auth is
/// disabled (useful for local development), matching the teacher's general
/// posture of making auth opt-in via configuration rather than code.
pub struct ApiKeyAuth {
    pub required_keys: Rc<Vec<String>>,
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ApiKeyAuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiKeyAuthMiddleware { service, required_keys: self.required_keys.clone() }))
    }
}

pub struct ApiKeyAuthMiddleware<S> {
    service: S,
    required_keys: Rc<Vec<String>>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if self.required_keys.is_empty() || key_is_valid(&req, &self.required_keys) {
            let fut = self.service.call(req);
            return Box::pin(async move { Ok(fut.await?.map_into_left_body()) });
        }
        let response = HttpResponse::from_error(ProxyError::Unauthorized).map_into_right_body();
        Box::pin(async move { Ok(req.into_response(response)) })
    }
}

fn key_is_valid(req: &ServiceRequest, required_keys: &[String]) -> bool {
    let supplied = bearer_token(req).or_else(|| api_key_header(req));
    match supplied {
        Some(supplied) => required_keys.iter().any(|key| constant_time_eq(key.as_bytes(), supplied.as_bytes())),
        None => false,
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    let header = req.headers().get(actix_web::http::header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::to_string)
}

fn api_key_header(req: &ServiceRequest) -> Option<String> {
    req.headers().get("X-Api-Key")?.to_str().ok().map(str::to_string)
}

/// Constant-time byte comparison so timing does not leak how many leading
/// bytes of a candidate key matched a configured one.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// CORS pre-flight and allow-list enforcement: requests whose `Origin`
/// header is not on the configured list receive no
/// `Access-Control-Allow-Origin`, per §4.3.
pub struct CorsAllowList {
    pub allowed_origins: Rc<Vec<String>>,
}

impl<S, B> Transform<S, ServiceRequest> for CorsAllowList
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = CorsAllowListMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CorsAllowListMiddleware { service, allowed_origins: self.allowed_origins.clone() }))
    }
}

pub struct CorsAllowListMiddleware<S> {
    service: S,
    allowed_origins: Rc<Vec<String>>,
}

impl<S, B> Service<ServiceRequest> for CorsAllowListMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let origin = req
            .headers()
            .get(actix_web::http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let allowed_origins = self.allowed_origins.clone();
        let fut = self.service.call(req);
        Box::pin(async move {
            let mut response = fut.await?;
            if let Some(origin) = origin {
                if allowed_origins.iter().any(|o| o == &origin) {
                    if let Ok(value) = HeaderValue::from_str(&origin) {
                        response.headers_mut().insert(
                            HeaderName::from_static("access-control-allow-origin"),
                            value,
                        );
                    }
                }
            }
            Ok(response)
        })
    }
}
