use super::handlers::{
    firstfactor, health, identity, logout, reset_password, secondfactor, state, verify,
};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated spec.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path and add the
    // route to OpenAPI.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(verify::verify))
        .routes(routes!(state::state))
        .routes(routes!(firstfactor::firstfactor))
        .routes(routes!(logout::logout))
        .routes(routes!(secondfactor::totp::verify))
        .routes(routes!(secondfactor::totp::register))
        .routes(routes!(secondfactor::webauthn::start))
        .routes(routes!(secondfactor::webauthn::verify))
        .routes(routes!(secondfactor::webauthn::register_start))
        .routes(routes!(secondfactor::webauthn::register_finish))
        .routes(routes!(secondfactor::duo::start))
        .routes(routes!(secondfactor::duo::verify))
        .routes(routes!(identity::start))
        .routes(routes!(identity::finish))
        .routes(routes!(reset_password::identity_start))
        .routes(routes!(reset_password::identity_finish))
        .routes(routes!(reset_password::reset_password));

    let mut verification_tag = Tag::new("verification");
    verification_tag.description = Some("Forward-auth verdicts for reverse proxies".to_string());

    let mut authentication_tag = Tag::new("authentication");
    authentication_tag.description = Some("First and second factor endpoints".to_string());

    let mut devices_tag = Tag::new("devices");
    devices_tag.description = Some("Second-factor device enrolment".to_string());

    let mut reset_tag = Tag::new("password-reset");
    reset_tag.description = Some("Identity-verified password reset".to_string());

    router.get_openapi_mut().tags = Some(vec![
        verification_tag,
        authentication_tag,
        devices_tag,
        reset_tag,
    ]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    OpenApiBuilder::new().info(info).build()
}
